//! HTTP API
//!
//! JSON endpoints over the engine operations plus a server-sent event
//! stream of engine activity. Errors map to status codes by kind:
//! validation 400, not found 404, timeout 504, anything else 500.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::error::{EideticError, Result};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// JSON error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

/// An engine error on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub EideticError);

impl From<EideticError> for ApiError {
    fn from(error: EideticError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            EideticError::Validation(_) => StatusCode::BAD_REQUEST,
            EideticError::NotFound(_) => StatusCode::NOT_FOUND,
            EideticError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// The HTTP API server
pub struct ApiServer {
    engine: Arc<Engine>,
}

impl ApiServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Listen until Ctrl+C or SIGTERM, then stop the engine's background
    /// cycles
    pub async fn serve(&self) -> Result<()> {
        let server = &self.engine.config().server;
        let addr: SocketAddr = server
            .listen_addr
            .parse()
            .map_err(|e| EideticError::Config(format!("Invalid listen address: {e}")))?;
        let timeout = Duration::from_secs(server.request_timeout_secs);

        let app = create_router(Arc::new(AppState {
            engine: Arc::clone(&self.engine),
        }))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            EideticError::Config(format!("Failed to bind to {addr}: {e}"))
        })?;
        tracing::info!("Eidetic API listening on {addr}");

        let engine = Arc::clone(&self.engine);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                engine.shutdown();
            })
            .await?;

        tracing::info!("API server shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/store", post(handlers::store_handler))
        .route("/recall", post(handlers::recall_handler))
        .route("/observations", post(handlers::observations_handler))
        .route("/relationships", post(handlers::relationships_handler))
        .route("/patterns", post(handlers::patterns_handler))
        .route("/stats", get(handlers::stats_handler))
        .route("/consolidate/{kind}", post(handlers::consolidate_handler))
        .route("/index/rebuild", post(handlers::rebuild_index_handler))
        .route("/events", get(handlers::events_handler))
        .with_state(state)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EideticError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (EideticError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                EideticError::Timeout {
                    branch: "vector_search".into(),
                    millis: 10,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                EideticError::Storage("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                EideticError::unavailable("vector_index", "down"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).status(), status);
        }
    }
}
