//! Rate limiting for sync-server.
//!
//! Connections come in through iroh, possibly via relays, so clients are
//! not identified by IP address. Limits are keyed instead by:
//! - **EndpointId** (32-byte public key) for connection attempts
//! - **DeviceToken** for requests
//!
//! plus one global limiter capping aggregate request throughput.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use sync_types::DeviceToken;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the server.
#[derive(Clone)]
pub struct RateLimits {
    /// Connection attempts per EndpointId, per minute.
    connection_limiter: Arc<KeyedLimiter<[u8; 32]>>,
    /// Requests per device, per minute.
    request_limiter: Arc<KeyedLimiter<DeviceToken>>,
    /// Requests per second across all devices.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_keys", &self.connection_limiter.len())
            .field("request_keys", &self.request_limiter.len())
            .finish_non_exhaustive()
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are rejected by config validation; should one get
    /// through anyway it is treated as one.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(non_zero(config.connections_per_endpoint));
        let request_quota = Quota::per_minute(non_zero(config.requests_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            request_limiter: Arc::new(RateLimiter::keyed(request_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt from `endpoint_id` is allowed.
    pub fn check_connection(&self, endpoint_id: &[u8; 32]) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(endpoint_id)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a request from `device` is allowed.
    ///
    /// The global limit is checked first, so a request rejected globally
    /// does not use up the device's quota.
    pub fn check_request(&self, device: &DeviceToken) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)?;
        self.request_limiter
            .check_key(device)
            .map_err(|_| RateLimitError::RequestLimitExceeded)
    }

    /// Number of tracked connection keys.
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Number of tracked device keys.
    pub fn request_keys_count(&self) -> usize {
        self.request_limiter.len()
    }

    /// Evict entries whose quota has fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.request_limiter.retain_recent();
        self.connection_limiter.shrink_to_fit();
        self.request_limiter.shrink_to_fit();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many connection attempts from this endpoint.
    #[error("connection rate limit exceeded")]
    ConnectionLimitExceeded,
    /// Too many requests from this device.
    #[error("request rate limit exceeded")]
    RequestLimitExceeded,
    /// Too many requests across all devices.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
