//! HTTP surface: uploads plus job and batch status.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::ops::AppState;
use crate::validate::MAX_PDF_BYTES;

/// Room for the form fields around the largest accepted PDF.
const MULTIPART_OVERHEAD: usize = 5 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/documents", post(handlers::upload))
        .route("/status/:job_id", get(handlers::job_status))
        .route("/batch/status/:batch_id", get(handlers::batch_status))
        .layer(DefaultBodyLimit::max(MAX_PDF_BYTES + MULTIPART_OVERHEAD))
        .with_state(state)
}

/// Serves the router on the configured address until Ctrl-C.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("HTTP API shutting down");
        })
        .await?;
    Ok(())
}
