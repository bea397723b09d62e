//! Protocol handler for the /oplog-sync/1 ALPN.
//!
//! Implements iroh's ProtocolHandler trait to accept incoming connections.

use crate::server::{ServerMetrics, SyncServer};
use crate::session::Session;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use std::sync::Arc;

/// Protocol identifier for oplog-sync.
pub const ALPN: &[u8] = b"/oplog-sync/1";

/// Largest frame accepted or sent on a stream.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Protocol handler for accepting oplog-sync connections.
#[derive(Clone, Debug)]
pub struct SyncProtocol {
    server: Arc<SyncServer>,
}

impl SyncProtocol {
    /// Create a new protocol handler.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }
}

impl ProtocolHandler for SyncProtocol {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let server = self.server.clone();
        async move {
            let remote_id = connection.remote_id();
            if let Err(e) = server.rate_limits().check_connection(remote_id.as_bytes()) {
                tracing::warn!(remote = %remote_id, error = %e, "Connection rate limited");
                ServerMetrics::incr(&server.metrics().rate_limit_hits);
                connection.close(1u32.into(), b"rate limited");
                return Ok(());
            }

            let Some(slot) = server.open_session() else {
                tracing::warn!(
                    remote = %remote_id,
                    max = server.config().limits.max_concurrent_sessions,
                    "Session limit reached"
                );
                connection.close(2u32.into(), b"too many sessions");
                return Ok(());
            };

            ServerMetrics::incr(&server.metrics().connections_total);

            // Spawn so the accept loop is not blocked.
            tokio::spawn(Session::new(slot, connection).run());
            Ok(())
        }
    }
}
