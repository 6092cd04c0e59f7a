//! HTTP ingress
//!
//! Routes uploads into the batch engine, serves converted files until they
//! expire, and reports health.

pub mod convert;
pub mod error;

use crate::engine::{BatchEngine, CONVERTED_ROUTE};
use crate::models::Config;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Multipart framing allowance on top of the raw file bytes.
const BODY_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BatchEngine>,
    pub config: Arc<Config>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: DateTime<Utc>,
    pub directories: HealthDirectories,
}

#[derive(Debug, Serialize)]
pub struct HealthDirectories {
    pub uploads: String,
    pub converted: String,
}

pub fn create_router(state: AppState) -> Router {
    let body_limit = state
        .config
        .max_files
        .saturating_mul(state.config.max_file_size)
        .saturating_add(BODY_OVERHEAD_BYTES);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/convert",
            post(convert::convert).layer(DefaultBodyLimit::max(body_limit)),
        )
        .nest_service(CONVERTED_ROUTE, ServeDir::new(&state.config.converted_dir))
        .layer(cors_layer(&state.config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Any origin when no allow-list is configured, otherwise exactly the listed ones.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if allowed_origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        message: "Image converter backend is running",
        timestamp: Utc::now(),
        directories: HealthDirectories {
            uploads: state.config.upload_dir.display().to_string(),
            converted: state.config.converted_dir.display().to_string(),
        },
    })
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
