//! # sync-types
//!
//! Wire format types for the oplog-sync group synchronization protocol.
//!
//! This crate provides the foundational types used across all oplog-sync crates:
//! - [`DeviceToken`], [`UserId`], [`GroupId`], [`Tick`] - Identity and ordering types
//! - [`Operation`] - Logged mutations and the entities they touch
//! - [`Message`] - Protocol messages (SyncData, JoinGroup, Batch, etc.)
//! - [`SyncError`], [`ErrorCode`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod operation;

pub use error::{ErrorCode, SyncError};
pub use ids::{DeviceToken, GroupId, Tick, UserId};
pub use messages::{
    Batch, Credentials, CurrentGroup, Done, ErrorReply, GetCurrentGroup, JoinGroup, LeaveGroup,
    Message, SyncData, PROTOCOL_VERSION,
};
pub use operation::{Operation, OperationType, RelatedEntity};
