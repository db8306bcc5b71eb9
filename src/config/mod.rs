//! Configuration module for mirage-mocker
//!
//! Services are declared in a YAML (or TOML/JSON) file. Server settings can be
//! overridden through environment variables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::hooks::HookError;

/// Environment variable prefix for server overrides
pub const ENV_PREFIX: &str = "MIRAGE_MOCKER";

/// Errors raised while turning configuration into a running dispatcher.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("invalid duration {value:?}: {reason}")]
    Duration { value: String, reason: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error loading hook: {0}")]
    Hook(#[from] HookError),

    #[error("service {index}: {source}")]
    Service {
        index: usize,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Host to bind the server to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Human readable logs instead of JSON lines
    #[serde(default)]
    pub pretty_logs: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pretty_logs: false,
        }
    }
}

impl ServerConfig {
    /// Address the listener binds to
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Layer `MIRAGE_MOCKER_*` environment variables (and `.env`) over these settings
    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        // Try to load .env file (ignore if not found)
        let _ = dotenvy::dotenv();

        let layered = config::Config::builder()
            .set_default("host", self.host.clone())?
            .set_default("port", i64::from(self.port))?
            .set_default("pretty_logs", self.pretty_logs)?
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        Ok(Self {
            host: layered.get_string("host")?,
            port: layered.get::<u16>("port")?,
            pretty_logs: layered.get_bool("pretty_logs")?,
        })
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(flatten)]
    pub server: ServerConfig,
    /// Services in evaluation order
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// One configured service endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub parser: ParserConfig,
}

/// Handling mode of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Mock,
    Pass,
}

/// Request matching plus mode-specific payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParserConfig {
    /// Regular expression searched for in the request path
    pub pattern: String,
    /// Accepted HTTP methods
    #[serde(default)]
    pub methods: Vec<String>,
    /// Required header values (all must match)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(rename = "type")]
    pub kind: RouteKind,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub responses: Vec<ResponseConfig>,
    #[serde(default)]
    pub pass_base_uri: Option<String>,
    #[serde(default, rename = "rewrite")]
    pub rewrites: Vec<RewriteConfig>,
    #[serde(default)]
    pub transform_lib: Option<String>,
    #[serde(default)]
    pub transform_symbol: Option<String>,
}

/// Path rewrite applied before forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    pub source: String,
    pub target: String,
}

/// How a mock response produces its body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Fixed,
    /// Echo the inbound request body
    #[serde(alias = "echo")]
    Request,
    Runnable,
}

/// One candidate response of a mock service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponseConfig {
    /// Status code per request method
    #[serde(default)]
    pub status: HashMap<String, u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub body_file: Option<PathBuf>,
    #[serde(default)]
    pub response_lib: Option<String>,
    #[serde(default)]
    pub response_symbol: Option<String>,
    /// Request header naming an override body file
    #[serde(default)]
    pub magic_header_name: Option<String>,
    /// Directory override body files are read from
    #[serde(default)]
    pub magic_header_folder: Option<PathBuf>,
    /// Share of traffic (0-100)
    #[serde(default)]
    pub distribution: f64,
    #[serde(default)]
    pub delay: Option<DelayConfig>,
}

/// Artificial latency bounds, e.g. `200ms`..`300ms`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
}

impl DelayConfig {
    /// Parsed bounds, `None` when no delay is configured
    pub fn bounds(&self) -> Result<Option<(Duration, Duration)>, ConfigError> {
        match (self.min.as_deref(), self.max.as_deref()) {
            (None, None) => Ok(None),
            (Some(min), Some(max)) => Ok(Some((parse_duration(min)?, parse_duration(max)?))),
            _ => Err(ConfigError::invalid(
                "delay requires both min and max to be set",
            )),
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific file.
    ///
    /// `.toml` and `.json` files are parsed as such, anything else as YAML.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            Some("json") => serde_json::from_str(&contents)?,
            _ => Self::from_yaml(&contents)?,
        };
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load configuration from file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.server = config.server.with_env_overrides()?;
        Ok(config)
    }
}

/// Parse a duration such as `300ms`, `1.5s` or `1m30s`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let err = |reason: &str| ConfigError::Duration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let input = value.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(err("empty"));
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| err("missing unit"))?;
        if number_len == 0 {
            return Err(err("expected a number"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| err("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(err("unknown unit")),
        };
        rest = &rest[unit_len..];
        total += number * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
