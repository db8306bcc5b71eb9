//! Request dispatch
//!
//! Entry point for every inbound request: find the first matching route and
//! hand the request to its mock or pass handling. Failures become `text/plain`
//! error responses.

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;
use tracing::Instrument;

use crate::config::{AppConfig, ConfigError};
use crate::hooks::HookRegistry;
use crate::logging::log_request;
use crate::routing::{Route, RouteMatcher, RouteMode};

/// Errors raised while handling a request
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("error processing request: no match found for request")]
    NoMatchFound,

    #[error("file not found {0}")]
    OverrideFileNotFound(String),

    #[error("can't read body: {0}")]
    BodyRead(String),

    #[error("error running request: {0}")]
    Runnable(String),

    #[error("proxy error: {0}")]
    Upstream(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NoMatchFound | DispatchError::OverrideFileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::BodyRead(_) | DispatchError::Runnable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = self.to_string();
        tracing::error!(status = %status.as_u16(), "{}", message);

        let mut response = (status, message).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        response
    }
}

/// Routes requests to mock or pass handling
#[derive(Default)]
pub struct Dispatcher {
    matcher: RouteMatcher,
}

impl Dispatcher {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            matcher: RouteMatcher::new(routes),
        }
    }

    /// Build every configured service. Any invalid service aborts startup.
    pub fn from_config(config: &AppConfig, hooks: &HookRegistry) -> Result<Self, ConfigError> {
        let routes = config
            .services
            .iter()
            .enumerate()
            .map(|(index, service)| {
                Route::from_config(&service.parser, hooks).map_err(|e| ConfigError::Service {
                    index,
                    source: Box::new(e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(routes = routes.len(), "Dispatcher initialized");
        Ok(Self::new(routes))
    }

    pub fn routes(&self) -> &[Route] {
        self.matcher.routes()
    }

    /// Handle one request to completion
    pub async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let span = tracing::info_span!(
            "request",
            id = %uuid::Uuid::new_v4(),
            method = %req.method(),
            path = %req.uri().path(),
        );

        async move {
            match self.handle(req).await {
                Ok(response) => {
                    tracing::debug!(status = %response.status().as_u16(), "Request processed");
                    response
                }
                Err(e) => e.into_response(),
            }
        }
        .instrument(span)
        .await
    }

    async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let (parts, body) = req.into_parts();
        let route = self.matcher.find(&parts).ok_or(DispatchError::NoMatchFound)?;
        tracing::debug!(pattern = %route.pattern(), "Matched route");

        match route.mode() {
            RouteMode::Mock(handler) => {
                let body = if route.log() {
                    let bytes = axum::body::to_bytes(body, usize::MAX)
                        .await
                        .map_err(|e| DispatchError::BodyRead(e.to_string()))?;
                    log_request(&parts.method, &parts.uri.to_string(), &parts.headers, &bytes);
                    Body::from(bytes)
                } else {
                    body
                };
                handler.respond(Request::from_parts(parts, body)).await
            }
            RouteMode::Pass(pass) => pass.forward(Request::from_parts(parts, body)).await,
        }
    }
}
