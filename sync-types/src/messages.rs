//! Protocol messages for oplog-sync.
//!
//! Every call runs on its own bidirectional stream. The client opens the
//! stream with exactly one request message ([`SyncData`], [`JoinGroup`],
//! [`LeaveGroup`] or [`GetCurrentGroup`]); what follows depends on the
//! call:
//!
//! ```text
//! SyncData:        client -> Batch* EndOfInput      server -> Operation* (Done | Error)
//! JoinGroup:                                        server -> Operation* (Done | Error)
//! LeaveGroup:                                       server -> Done | Error
//! GetCurrentGroup:                                  server -> CurrentGroup | Error
//! ```

use serde::{Deserialize, Serialize};

use crate::{DeviceToken, ErrorCode, GroupId, Operation, SyncError};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// All possible protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Open a bidirectional synchronization exchange
    SyncData(SyncData),
    /// Join another device's group
    JoinGroup(JoinGroup),
    /// Leave the current group
    LeaveGroup(LeaveGroup),
    /// Ask which group the device is in
    GetCurrentGroup(GetCurrentGroup),
    /// Inbound batch of new operations (client -> server)
    Batch(Batch),
    /// The client has no more batches to send
    EndOfInput,
    /// One outbound operation (server -> client)
    Operation(Operation),
    /// Reply to GetCurrentGroup
    CurrentGroup(CurrentGroup),
    /// Successful end of a call
    Done(Done),
    /// Failed end of a call
    Error(ErrorReply),
}

impl Message {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Credentials carried by a request message, if this is one.
    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Self::SyncData(m) => Some(&m.auth),
            Self::JoinGroup(m) => Some(&m.auth),
            Self::LeaveGroup(m) => Some(&m.auth),
            Self::GetCurrentGroup(m) => Some(&m.auth),
            _ => None,
        }
    }

    /// Short name of the message kind, for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncData(_) => "SyncData",
            Self::JoinGroup(_) => "JoinGroup",
            Self::LeaveGroup(_) => "LeaveGroup",
            Self::GetCurrentGroup(_) => "GetCurrentGroup",
            Self::Batch(_) => "Batch",
            Self::EndOfInput => "EndOfInput",
            Self::Operation(_) => "Operation",
            Self::CurrentGroup(_) => "CurrentGroup",
            Self::Done(_) => "Done",
            Self::Error(_) => "Error",
        }
    }
}

/// Identification carried by every request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Opaque credential for the authentication provider
    pub credential: String,
    /// The calling device
    pub device_token: DeviceToken,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("version", &self.version)
            .field("credential", &"[REDACTED]")
            .field("device_token", &self.device_token)
            .finish()
    }
}

/// Request a bidirectional sync of the device's current group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    /// Caller identification
    pub auth: Credentials,
}

/// Request to move the device into `group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroup {
    /// Caller identification
    pub auth: Credentials,
    /// Group to join
    pub group: GroupId,
    /// Carry the device's pending history into the new group
    pub merge_data: bool,
}

/// Request to move the device back into its own group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroup {
    /// Caller identification
    pub auth: Credentials,
    /// Keep a private copy of the group's history
    pub copy_data: bool,
}

/// Request the device's current group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCurrentGroup {
    /// Caller identification
    pub auth: Credentials,
}

/// A batch of operations recorded by the device since its last sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Batch {
    /// Operations, in the order the device recorded them
    pub operations: Vec<Operation>,
}

/// The device's current group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentGroup {
    /// Current group identifier
    pub group: GroupId,
}

/// Successful completion of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Done {
    /// Number of operations delivered to the device during the call
    pub delivered: u64,
    /// Number of the device's operations recorded during the call. A
    /// SyncData that recorded fewer than the device sent stopped early;
    /// the rest can be resent on the next sync.
    pub received: u64,
}

/// Failed completion of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}
