//! HTTP front end.

pub mod error;
pub mod middleware;
pub mod routes;

use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tracing::info;

pub use error::ApiError;
pub use routes::{AppState, FileRequest, ToolRequest};

/// Build the application router with every endpoint and the standard
/// middleware stack.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/version", get(routes::version))
        .route("/list-tools", get(routes::list_tools))
        .route("/list-models", get(routes::list_models))
        .route("/run-tool", post(routes::run_tool))
        .route("/run-tool-stream", post(routes::run_tool_stream))
        .route(
            "/run-tool-stream-with-events",
            post(routes::run_tool_stream_with_events),
        )
        .route("/run-file", post(routes::run_file))
        .route("/run-file-stream", post(routes::run_file_stream))
        .route(
            "/run-file-stream-with-events",
            post(routes::run_file_stream_with_events),
        )
        .route("/parse", post(routes::parse))
        .route("/fmt", post(routes::fmt))
        .fallback(routes::not_found)
        .with_state(state);
    middleware::apply(router)
}

/// Serve until Ctrl+C or SIGTERM, then let in-flight requests finish.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Server ready");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
