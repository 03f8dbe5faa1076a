//! Management API router and server

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::error::ApiError;
use super::handlers;
use crate::business::Aggregator;
use crate::logger::{log, LogBuffer};
use crate::server_runner::RestartHandle;

/// Default bound for `POST /api/test` connectivity checks
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every handler
#[derive(Clone)]
pub struct ApiState {
    pub aggregator: Aggregator,
    pub logs: LogBuffer,
    pub restart: RestartHandle,
    /// Bearer token required on `/api/*` when set
    pub token: Option<Arc<str>>,
    pub test_timeout: Duration,
}

/// Reject `/api/*` requests without the configured bearer token
async fn require_token(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref expected) = state.token else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| bool::from(token.trim().as_bytes().ct_eq(expected.as_bytes())));

    if authorized {
        next.run(request).await
    } else {
        log::warn!(path = %request.uri().path(), "Rejected management request without valid token");
        ApiError::Unauthorized.into_response()
    }
}

async fn not_found() -> ApiError {
    ApiError::not_found("route not found")
}

pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/stats", get(handlers::get_stats))
        .route("/status", get(handlers::get_status))
        .route(
            "/config",
            get(handlers::get_config).put(handlers::update_config),
        )
        .route("/connections", get(handlers::list_connections))
        .route(
            "/connections/:id",
            get(handlers::get_connection).delete(handlers::disconnect_connection),
        )
        .route("/logs", get(handlers::get_logs))
        .route("/test", post(handlers::test_connection))
        .route("/restart", post(handlers::restart))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/ping", get(handlers::ping))
        .nest("/api", api)
        .fallback(not_found)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!(address = %addr, auth = state.token.is_some(), "Management API started");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
