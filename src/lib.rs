//! Mirage Mocker - configurable HTTP intermediary
//!
//! For each inbound request, either:
//! - synthesizes a canned response (mock mode), picked from weighted
//!   candidates with optional latency, or
//! - forwards it to an upstream service after path rewriting and an optional
//!   transform hook (pass mode)
//!
//! Routes are evaluated in configuration order; the first match wins.

pub mod body;
pub mod config;
pub mod dispatcher;
pub mod hooks;
pub mod logging;
pub mod mock;
pub mod proxy;
pub mod routing;
pub mod server;

pub use config::{AppConfig, ConfigError, ServerConfig};
pub use dispatcher::{DispatchError, Dispatcher};
pub use hooks::{HookError, HookRegistry, HookRequest, ResponseSink};

/// Application result type
pub type Result<T> = anyhow::Result<T>;
