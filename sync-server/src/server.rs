//! Shared server state.
//!
//! `SyncServer` owns the orchestrator, the authenticator and the rate
//! limiters, and counts what the sessions do with them.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::limits::RateLimits;
use crate::service::SyncService;
use crate::storage::OperationStore;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Completed SyncData calls.
    pub syncs_total: AtomicU64,
    /// Completed JoinGroup calls.
    pub joins_total: AtomicU64,
    /// Completed LeaveGroup calls.
    pub leaves_total: AtomicU64,
    /// Completed GetCurrentGroup calls.
    pub group_queries_total: AtomicU64,
    /// Operations received from devices and recorded.
    pub operations_received: AtomicU64,
    /// Operations delivered to devices.
    pub operations_delivered: AtomicU64,
    /// Operations removed by conflict compaction.
    pub conflicts_compacted: AtomicU64,
    /// Connections accepted (before any request).
    pub connections_total: AtomicU64,
    /// Rate limit rejections (connection + request + global).
    pub rate_limit_hits: AtomicU64,
    /// Calls that ended with an error reply.
    pub errors_total: AtomicU64,
}

impl ServerMetrics {
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }
}

/// The sync server.
pub struct SyncServer {
    config: Config,
    service: SyncService,
    authenticator: Arc<dyn Authenticator>,
    rate_limits: RateLimits,
    metrics: ServerMetrics,
    active_sessions: AtomicUsize,
    started: Instant,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("active_sessions", &self.active_sessions())
            .field("locked_groups", &self.service.locks().len())
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Build the server and spawn the ingestion workers.
    pub fn new(
        config: Config,
        store: Arc<dyn OperationStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let service = SyncService::new(store, &config.service);
        Self {
            config,
            service,
            authenticator,
            rate_limits,
            metrics: ServerMetrics::default(),
            active_sessions: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The orchestrator.
    pub fn service(&self) -> &SyncService {
        &self.service
    }

    /// The credential verifier.
    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    /// Rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Connections currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Time since the server was built.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Claim a session slot, or `None` when the server is full.
    ///
    /// The slot is released when the returned guard drops.
    pub fn open_session(self: &Arc<Self>) -> Option<SessionSlot> {
        let max = self.config.limits.max_concurrent_sessions;
        self.active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .ok()
            .map(|_| SessionSlot {
                server: Arc::clone(self),
            })
    }
}

/// A claimed session slot.
#[derive(Debug)]
pub struct SessionSlot {
    server: Arc<SyncServer>,
}

impl SessionSlot {
    /// The server this slot belongs to.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.server.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}
