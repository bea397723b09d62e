//! Operation log storage for sync-server.
//!
//! The orchestrator and the ingestion workers only ever see
//! [`OperationStore`]; backends are swappable behind it.

mod memory;
mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StorageError;
use async_trait::async_trait;
use sync_types::{DeviceToken, GroupId, Operation, Tick, UserId};

/// An operation as persisted in a group's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedOperation {
    /// Store-assigned sequence number; strictly increasing.
    pub id: i64,
    /// Device that recorded the operation.
    pub device_token: DeviceToken,
    /// Group the operation currently belongs to.
    pub group_id: GroupId,
    /// The operation itself.
    pub operation: Operation,
    /// Logical time of the write (refreshed by migration).
    pub created_at: Tick,
    /// Wall-clock unix seconds of the original write. Advisory only.
    pub recorded_at: i64,
}

/// Sync bookkeeping for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// The device.
    pub device_token: DeviceToken,
    /// Owning user.
    pub user_id: UserId,
    /// Current group.
    pub group_id: GroupId,
    /// Logical time of the last completed sync.
    pub last_sync: Tick,
}

/// Row counts exposed on the metrics endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Live operations across all groups.
    pub operations: u64,
    /// Known devices.
    pub devices: u64,
    /// Groups with at least one member device.
    pub groups: u64,
}

/// Trait for operation log backends.
///
/// Every call is atomic on its own. Sequences of calls that must appear
/// atomic (compaction followed by touch, say) are serialized by the
/// caller holding the group lock.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// The device's current group, or the user's own group if the device
    /// is unknown.
    async fn resolve_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
    ) -> Result<GroupId, StorageError>;

    /// Append `operations` to `group`'s log, all or nothing.
    ///
    /// Returns the number of operations written.
    async fn record_operations(
        &self,
        device: &DeviceToken,
        group: &GroupId,
        operations: &[Operation],
    ) -> Result<u64, StorageError>;

    /// Drop every operation in `device`'s unsynced window of `group` that
    /// a later DELETE on a shared entity supersedes.
    ///
    /// Returns the number of operations removed.
    async fn compact_conflicts(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<u64, StorageError>;

    /// Operations in `group` recorded by other devices after `device`'s
    /// last sync, tombstones excluded, in sequence order.
    async fn fetch_unsynced(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<Vec<LoggedOperation>, StorageError>;

    /// Every live, non-tombstone operation of `group`, in sequence order.
    async fn fetch_all(&self, group: &GroupId) -> Result<Vec<LoggedOperation>, StorageError>;

    /// Move `device` into `group` without touching its sync cursor.
    async fn reassign_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<(), StorageError>;

    /// Rewrite every operation of `from` to belong to `to`, refreshing its
    /// logical time so that members of `to` see it as new.
    async fn migrate_operations(&self, from: &GroupId, to: &GroupId)
        -> Result<u64, StorageError>;

    /// Delete every operation of `group`.
    async fn delete_operations(&self, group: &GroupId) -> Result<u64, StorageError>;

    /// Duplicate every operation of `from` into `to`, leaving `from`
    /// untouched. All or nothing.
    async fn copy_operations(&self, from: &GroupId, to: &GroupId) -> Result<u64, StorageError>;

    /// Whether any device is a member of `group`.
    async fn group_exists(&self, group: &GroupId) -> Result<bool, StorageError>;

    /// Record a completed sync: upsert the device's group and advance its
    /// cursor past everything written so far.
    async fn touch(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<Tick, StorageError>;

    /// Bookkeeping for one device, if known.
    async fn device_state(&self, device: &DeviceToken)
        -> Result<Option<DeviceState>, StorageError>;

    /// Row counts.
    async fn stats(&self) -> Result<StoreStats, StorageError>;
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
