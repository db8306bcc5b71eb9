//! HTTP Server module
//!
//! Every request, whatever its path or method, goes to the dispatcher.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the main server router
pub fn create_server_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .fallback(dispatch_handler)
        .with_state(dispatcher)
        .layer(TraceLayer::new_for_http())
}

async fn dispatch_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    req: Request<Body>,
) -> Response<Body> {
    dispatcher.dispatch(req).await
}

/// Start the HTTP server
pub async fn start_server(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let addr = config.addr();
    let app = create_server_router(dispatcher);

    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
