//! Logging setup and full request/response capture

use axum::http::{HeaderMap, Method, StatusCode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the defaults. Pretty output is meant for terminals,
/// JSON lines for everything else.
pub fn init(pretty: bool, verbose: bool) -> anyhow::Result<()> {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mirage_mocker={},tower_http={}", log_level, log_level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if pretty {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    }
    Ok(())
}

fn format_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes())))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Log a request in full
pub fn log_request(method: &Method, uri: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        method = %method,
        uri = %uri,
        headers = %format_headers(headers),
        body = %String::from_utf8_lossy(body),
        "Request"
    );
}

/// Log a response in full
pub fn log_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        status = %status.as_u16(),
        headers = %format_headers(headers),
        body = %String::from_utf8_lossy(body),
        "Response"
    );
}
