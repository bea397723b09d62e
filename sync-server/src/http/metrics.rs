//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&server).await,
    )
}

async fn render(server: &SyncServer) -> String {
    let m = server.metrics();

    // Gauges
    let sessions = server.active_sessions();
    let locked_groups = server.service().locks().len();
    let queued_drains = server.service().queued_drains();

    // Counters
    let syncs = m.syncs_total.load(Ordering::Relaxed);
    let joins = m.joins_total.load(Ordering::Relaxed);
    let leaves = m.leaves_total.load(Ordering::Relaxed);
    let group_queries = m.group_queries_total.load(Ordering::Relaxed);
    let received = m.operations_received.load(Ordering::Relaxed);
    let delivered = m.operations_delivered.load(Ordering::Relaxed);
    let compacted = m.conflicts_compacted.load(Ordering::Relaxed);
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    // Best effort; a failing store reports zeros rather than failing the scrape.
    let stats = match server.service().store().stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read store stats");
            Default::default()
        }
    };

    format!(
        r#"# HELP sync_server_sessions_active Number of connections being served
# TYPE sync_server_sessions_active gauge
sync_server_sessions_active {sessions}

# HELP sync_server_locked_groups Groups with a held or awaited lock
# TYPE sync_server_locked_groups gauge
sync_server_locked_groups {locked_groups}

# HELP sync_server_queued_drains Inbound drains waiting for a worker
# TYPE sync_server_queued_drains gauge
sync_server_queued_drains {queued_drains}

# HELP sync_server_info Server information
# TYPE sync_server_info gauge
sync_server_info{{version="{version}"}} 1

# HELP sync_server_syncs_total Completed SyncData calls
# TYPE sync_server_syncs_total counter
sync_server_syncs_total {syncs}

# HELP sync_server_joins_total Completed JoinGroup calls
# TYPE sync_server_joins_total counter
sync_server_joins_total {joins}

# HELP sync_server_leaves_total Completed LeaveGroup calls
# TYPE sync_server_leaves_total counter
sync_server_leaves_total {leaves}

# HELP sync_server_group_queries_total Completed GetCurrentGroup calls
# TYPE sync_server_group_queries_total counter
sync_server_group_queries_total {group_queries}

# HELP sync_server_operations_received_total Operations recorded from devices
# TYPE sync_server_operations_received_total counter
sync_server_operations_received_total {received}

# HELP sync_server_operations_delivered_total Operations delivered to devices
# TYPE sync_server_operations_delivered_total counter
sync_server_operations_delivered_total {delivered}

# HELP sync_server_conflicts_compacted_total Operations removed by conflict compaction
# TYPE sync_server_conflicts_compacted_total counter
sync_server_conflicts_compacted_total {compacted}

# HELP sync_server_connections_total Total connections accepted
# TYPE sync_server_connections_total counter
sync_server_connections_total {conns_total}

# HELP sync_server_rate_limit_hits_total Total rate limit rejections
# TYPE sync_server_rate_limit_hits_total counter
sync_server_rate_limit_hits_total {rate_limits}

# HELP sync_server_errors_total Calls that ended with an error reply
# TYPE sync_server_errors_total counter
sync_server_errors_total {errors}

# HELP sync_server_store_operations Operations currently logged
# TYPE sync_server_store_operations gauge
sync_server_store_operations {store_operations}

# HELP sync_server_store_devices Devices known to the store
# TYPE sync_server_store_devices gauge
sync_server_store_devices {store_devices}

# HELP sync_server_store_groups Groups with at least one member
# TYPE sync_server_store_groups gauge
sync_server_store_groups {store_groups}
"#,
        version = env!("CARGO_PKG_VERSION"),
        store_operations = stats.operations,
        store_devices = stats.devices,
        store_groups = stats.groups,
    )
}
