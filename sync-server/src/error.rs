//! Error types for sync-server.

use std::fmt;
use std::path::PathBuf;
use sync_types::{ErrorCode, GroupId};

/// Main error type for sync-server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Orchestrator error.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

impl ServerError {
    /// Caller-visible error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(e) => e.code(),
            Self::Service(e) => e.code(),
        }
    }
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table the row came from.
        table: &'static str,
        /// What could not be decoded.
        reason: String,
    },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Errors on one direction of a session's operation stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The peer went away before signalling end of input.
    #[error("stream closed by peer")]
    Closed,

    /// Reading from the peer failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Writing to the peer failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The peer sent something other than a batch.
    #[error("invalid inbound message: {0}")]
    InvalidMessage(String),
}

/// Protocol steps, named so a failure says where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Resolving the device's current group.
    ResolveGroup,
    /// Checking that a join target has members.
    CheckGroup,
    /// Reading the device's unsynced window.
    FetchUnsynced,
    /// Reading a group's full history.
    FetchAll,
    /// Writing operations to the peer.
    DeliverOperations,
    /// Reading inbound batches from the peer.
    ReceiveOperations,
    /// Recording inbound operations.
    RecordOperations,
    /// Running conflict compaction.
    CompactConflicts,
    /// Advancing the device's sync cursor.
    Touch,
    /// Moving the device to another group.
    ReassignGroup,
    /// Moving operations between groups.
    MigrateOperations,
    /// Discarding a group's operations.
    DeleteOperations,
    /// Duplicating a group's operations.
    CopyOperations,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolveGroup => "resolve group",
            Self::CheckGroup => "check group exists",
            Self::FetchUnsynced => "fetch unsynced operations",
            Self::FetchAll => "fetch group history",
            Self::DeliverOperations => "deliver operations",
            Self::ReceiveOperations => "receive operations",
            Self::RecordOperations => "record operations",
            Self::CompactConflicts => "compact conflicts",
            Self::Touch => "update device sync time",
            Self::ReassignGroup => "reassign device group",
            Self::MigrateOperations => "migrate operations",
            Self::DeleteOperations => "delete operations",
            Self::CopyOperations => "copy operations",
        };
        f.write_str(name)
    }
}

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The join target has no members.
    #[error("group not found: {group}")]
    GroupNotFound {
        /// The requested group.
        group: GroupId,
    },

    /// Leaving was requested while already in the own group.
    #[error("device is not in a shared group")]
    NotInGroup,

    /// Joining was requested for the group the device is already in.
    #[error("device is already in group {group}")]
    AlreadyInGroup {
        /// The device's current group.
        group: GroupId,
    },

    /// The group lock deadline expired.
    #[error("timed out waiting for lock on {groups:?}")]
    LockTimeout {
        /// Groups that were being locked.
        groups: Vec<GroupId>,
    },

    /// The ingestion worker pool no longer accepts jobs.
    #[error("ingestion worker pool is closed")]
    PoolClosed,

    /// A store call failed.
    #[error("failed to {step}: {source}")]
    Store {
        /// The step that failed.
        step: SyncStep,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The session stream failed.
    #[error("failed to {step}: {source}")]
    Stream {
        /// The step that failed.
        step: SyncStep,
        /// Underlying stream error.
        #[source]
        source: StreamError,
    },
}

impl ServiceError {
    /// Wrap a storage error with the step that produced it.
    pub fn store(step: SyncStep) -> impl FnOnce(StorageError) -> Self {
        move |source| Self::Store { step, source }
    }

    /// Wrap a stream error with the step that produced it.
    pub fn stream(step: SyncStep) -> impl FnOnce(StreamError) -> Self {
        move |source| Self::Stream { step, source }
    }

    /// The step that failed, for collaborator failures.
    pub fn step(&self) -> Option<SyncStep> {
        match self {
            Self::Store { step, .. } | Self::Stream { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Caller-visible error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::GroupNotFound { .. } => ErrorCode::GroupNotFound,
            Self::NotInGroup => ErrorCode::NotInGroup,
            Self::AlreadyInGroup { .. } => ErrorCode::AlreadyInGroup,
            Self::LockTimeout { .. } | Self::PoolClosed => ErrorCode::Unavailable,
            Self::Store { .. } | Self::Stream { .. } => ErrorCode::Internal,
        }
    }
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Invalid message format.
    #[error("invalid message format: {reason}")]
    InvalidMessage {
        /// Reason the message is invalid.
        reason: String,
    },

    /// Unexpected message type.
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: String,
        /// Actual message type received.
        actual: String,
    },

    /// Credential rejected.
    #[error("authentication failed: {0}")]
    Unauthenticated(#[from] crate::auth::AuthError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// Reason for rate limiting.
        reason: String,
    },

    /// The request frame did not arrive in time.
    #[error("timed out waiting for request")]
    Timeout,

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: client={client}, server={server}")]
    VersionMismatch {
        /// Client protocol version.
        client: u8,
        /// Server protocol version.
        server: u8,
    },
}

impl ProtocolError {
    /// Caller-visible error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated(_) => ErrorCode::Unauthenticated,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Stream(_) => ErrorCode::Internal,
            Self::InvalidMessage { .. }
            | Self::UnexpectedMessage { .. }
            | Self::Timeout
            | Self::VersionMismatch { .. } => ErrorCode::InvalidRequest,
        }
    }
}

impl From<StreamError> for ProtocolError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::InvalidMessage(reason) => Self::InvalidMessage { reason },
            other => Self::Stream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_name_the_step() {
        let err = ServiceError::store(SyncStep::CompactConflicts)(StorageError::Migration(
            "boom".into(),
        ));
        assert_eq!(err.step(), Some(SyncStep::CompactConflicts));
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(
            err.to_string(),
            "failed to compact conflicts: migration error: boom"
        );
    }

    #[test]
    fn stream_failures_name_the_step() {
        let err = ServiceError::stream(SyncStep::DeliverOperations)(StreamError::Closed);
        assert_eq!(err.step(), Some(SyncStep::DeliverOperations));
        assert!(err.to_string().starts_with("failed to deliver operations"));
    }

    #[test]
    fn domain_errors_have_stable_codes() {
        let not_found = ServiceError::GroupNotFound {
            group: GroupId::new("g"),
        };
        assert_eq!(not_found.code(), ErrorCode::GroupNotFound);
        assert_eq!(not_found.step(), None);
        assert_eq!(ServiceError::NotInGroup.code(), ErrorCode::NotInGroup);
        assert_eq!(ServiceError::PoolClosed.code(), ErrorCode::Unavailable);
    }

    #[test]
    fn invalid_inbound_message_maps_to_invalid_request() {
        let err: ProtocolError = StreamError::InvalidMessage("bad".into()).into();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
        let err: ProtocolError = StreamError::Closed.into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn server_error_forwards_codes() {
        let err: ServerError = ServiceError::AlreadyInGroup {
            group: GroupId::new("g"),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::AlreadyInGroup);

        let err: ServerError = ProtocolError::Timeout.into();
        assert_eq!(err.code(), ErrorCode::InvalidRequest);

        let err: ServerError = ServiceError::store(SyncStep::Touch)(StorageError::Migration(
            "x".into(),
        ))
        .into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
