//! Route handlers for the management API

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;

use super::error::{ApiError, ApiResult};
use super::server::ApiState;
use crate::business::ServerStats;
use crate::config::{ConfigUpdate, ConfigView};
use crate::core::{Session, SessionId};
use crate::logger::log;

const DEFAULT_LOG_LIMIT: usize = 100;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Non-numeric ids can never name a session
fn parse_session_id(raw: &str) -> ApiResult<SessionId> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("connection {} not found", raw)))
}

pub async fn ping() -> Json<Value> {
    Json(json!({ "msg": "pong" }))
}

pub async fn get_stats(State(state): State<ApiState>) -> Json<ServerStats> {
    Json(state.aggregator.current_stats())
}

pub async fn get_status(State(state): State<ApiState>) -> Json<Value> {
    let stats = state.aggregator.current_stats();
    Json(json!({
        "status": stats.status,
        "timestamp": unix_now(),
        "uptime": stats.uptime,
    }))
}

pub async fn get_config(State(state): State<ApiState>) -> Json<ConfigView> {
    Json(state.aggregator.current_config())
}

pub async fn update_config(
    State(state): State<ApiState>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(update) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let config = state.aggregator.update_config(&update).map_err(|e| {
        log::warn!(error = %e, "Config update rejected");
        ApiError::from(e)
    })?;
    log::info!("Config updated via management API");
    Ok(Json(json!({
        "message": "config updated",
        "config": config,
    })))
}

pub async fn list_connections(State(state): State<ApiState>) -> Json<Vec<Session>> {
    Json(state.aggregator.sessions().list())
}

pub async fn get_connection(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<Session>> {
    let id = parse_session_id(&raw_id)?;
    state
        .aggregator
        .sessions()
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("connection {} not found", id)))
}

pub async fn disconnect_connection(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = parse_session_id(&raw_id)?;
    if !state.aggregator.sessions().disconnect(id) {
        return Err(ApiError::not_found(format!("connection {} not found", id)));
    }
    log::info!(session = id, "Connection disconnected via management API");
    Ok(Json(json!({
        "message": format!("connection {} disconnected", id),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<String>,
    pub limit: usize,
}

pub async fn get_logs(
    State(state): State<ApiState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<Json<LogsResponse>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(LogsResponse {
        logs: state.logs.recent(limit),
        limit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub host: String,
    pub port: i64,
}

#[derive(Debug, Serialize)]
pub struct TestResponse {
    pub success: bool,
    pub message: String,
    /// Connect time, e.g. `"45ms"`
    pub latency: String,
}

/// Check `host:port` with a bounded TCP connect
pub async fn test_connection(
    State(state): State<ApiState>,
    payload: Result<Json<TestRequest>, JsonRejection>,
) -> ApiResult<Json<TestResponse>> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let host = req.host.trim();
    if host.is_empty() {
        return Err(ApiError::bad_request("host must not be empty"));
    }
    let port = u16::try_from(req.port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ApiError::bad_request("port must be in 1..=65535"))?;

    let started = Instant::now();
    match tokio::time::timeout(state.test_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => {
            let latency = started.elapsed().as_millis();
            log::debug!(host = host, port = port, latency_ms = latency as u64, "Connectivity check succeeded");
            Ok(Json(TestResponse {
                success: true,
                message: format!("connected to {}:{}", host, port),
                latency: format!("{}ms", latency),
            }))
        }
        Ok(Err(e)) => Err(ApiError::BadGateway(format!(
            "failed to connect to {}:{}: {}",
            host, port, e
        ))),
        Err(_) => Err(ApiError::GatewayTimeout(format!(
            "connection to {}:{} timed out after {:?}",
            host, port, state.test_timeout
        ))),
    }
}

/// Acknowledge immediately; the supervisor restarts the listener in the background
pub async fn restart(State(state): State<ApiState>) -> Json<Value> {
    state.restart.request();
    log::info!("Listener restart requested via management API");
    Json(json!({
        "message": "restart initiated",
        "timestamp": unix_now(),
    }))
}
