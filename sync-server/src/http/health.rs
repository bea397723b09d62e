//! Health check endpoint.

use crate::server::SyncServer;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Connections currently being served.
    pub sessions: usize,
    /// Groups with a live lock entry (held or awaited).
    pub locked_groups: usize,
    /// Inbound drains waiting for a worker.
    pub queued_drains: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot the server's current state.
    pub fn of(server: &SyncServer) -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sessions: server.active_sessions(),
            locked_groups: server.service().locks().len(),
            queued_drains: server.service().queued_drains(),
            uptime_seconds: server.uptime().as_secs(),
        }
    }
}

/// Health check handler.
pub async fn health_handler(Extension(server): Extension<Arc<SyncServer>>) -> Json<HealthStatus> {
    Json(HealthStatus::of(&server))
}
