//! HTTP request handlers

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde::Serialize;

use crate::docker::manager::{SessionState, SessionStatus};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_secs: i64,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "dockyard".to_string(),
        version: version.version,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Host sessions response
#[derive(Debug, Serialize)]
pub struct HostsResponse {
    pub hosts: Vec<SessionStatus>,
    pub connected: usize,
}

/// Session state of every registered host
pub async fn hosts_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let hosts = state.manager.status();
    let connected = hosts
        .iter()
        .filter(|h| h.state == SessionState::Connected)
        .count();
    Json(HostsResponse { hosts, connected })
}
