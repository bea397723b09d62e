//! The two directions of a sync session, as seen by the orchestrator.
//!
//! The transport adapter implements these over a QUIC stream; tests use
//! the channel-backed versions in [`testing`].

use crate::error::StreamError;
use async_trait::async_trait;
use sync_types::Operation;

/// Inbound half: batches of operations the device recorded since its last
/// sync.
#[async_trait]
pub trait OperationSource: Send {
    /// The next batch, or `None` once the peer signalled end of input.
    async fn next_batch(&mut self) -> Result<Option<Vec<Operation>>, StreamError>;
}

/// Outbound half: operations the device has not seen yet.
#[async_trait]
pub trait OperationSink: Send {
    /// Deliver one operation to the device.
    async fn send(&mut self, operation: &Operation) -> Result<(), StreamError>;
}
