//! Error types for oplog-sync.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Stable, caller-visible error codes carried in `Error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The target group has no members.
    GroupNotFound,
    /// The device tried to leave while already in its own group.
    NotInGroup,
    /// The device tried to join the group it is already in.
    AlreadyInGroup,
    /// The credential could not be verified.
    Unauthenticated,
    /// The request failed validation.
    InvalidRequest,
    /// The caller exceeded a rate limit.
    RateLimited,
    /// The server is at capacity or shutting down.
    Unavailable,
    /// Any other failure; the message describes the failed step.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GroupNotFound => "group not found",
            Self::NotInGroup => "not in group",
            Self::AlreadyInGroup => "already in group",
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidRequest => "invalid request",
            Self::RateLimited => "rate limited",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}
