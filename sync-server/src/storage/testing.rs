//! Store wrapper that records every call and can inject failures.

use super::{DeviceState, LoggedOperation, MemoryStore, OperationStore, StoreStats};
use crate::error::StorageError;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use sync_types::{DeviceToken, GroupId, Operation, Tick, UserId};

/// One observed store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub name: &'static str,
    pub device: Option<DeviceToken>,
    pub group: Option<GroupId>,
}

#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    calls: Mutex<Vec<Call>>,
    fail_on: Mutex<Option<&'static str>>,
    delay: Option<Duration>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every call, widening race windows.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make every later call named `name` fail.
    pub fn fail_on(&self, name: &'static str) {
        *self.fail_on.lock().unwrap() = Some(name);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|call| call.name).collect()
    }

    /// Forget calls made so far (e.g. during test setup).
    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    async fn observe(
        &self,
        name: &'static str,
        device: Option<&DeviceToken>,
        group: Option<&GroupId>,
    ) -> Result<(), StorageError> {
        self.calls.lock().unwrap().push(Call {
            name,
            device: device.cloned(),
            group: group.cloned(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_on.lock().unwrap() == Some(name) {
            return Err(StorageError::Migration(format!("injected failure in {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl OperationStore for RecordingStore {
    async fn resolve_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
    ) -> Result<GroupId, StorageError> {
        self.observe("resolve_group", Some(device), None).await?;
        self.inner.resolve_group(device, user).await
    }

    async fn record_operations(
        &self,
        device: &DeviceToken,
        group: &GroupId,
        operations: &[Operation],
    ) -> Result<u64, StorageError> {
        self.observe("record_operations", Some(device), Some(group))
            .await?;
        self.inner.record_operations(device, group, operations).await
    }

    async fn compact_conflicts(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<u64, StorageError> {
        self.observe("compact_conflicts", Some(device), Some(group))
            .await?;
        self.inner.compact_conflicts(device, group).await
    }

    async fn fetch_unsynced(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<Vec<LoggedOperation>, StorageError> {
        self.observe("fetch_unsynced", Some(device), Some(group)).await?;
        self.inner.fetch_unsynced(device, group).await
    }

    async fn fetch_all(&self, group: &GroupId) -> Result<Vec<LoggedOperation>, StorageError> {
        self.observe("fetch_all", None, Some(group)).await?;
        self.inner.fetch_all(group).await
    }

    async fn reassign_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<(), StorageError> {
        self.observe("reassign_group", Some(device), Some(group)).await?;
        self.inner.reassign_group(device, user, group).await
    }

    async fn migrate_operations(
        &self,
        from: &GroupId,
        to: &GroupId,
    ) -> Result<u64, StorageError> {
        self.observe("migrate_operations", None, Some(from)).await?;
        self.inner.migrate_operations(from, to).await
    }

    async fn delete_operations(&self, group: &GroupId) -> Result<u64, StorageError> {
        self.observe("delete_operations", None, Some(group)).await?;
        self.inner.delete_operations(group).await
    }

    async fn copy_operations(&self, from: &GroupId, to: &GroupId) -> Result<u64, StorageError> {
        self.observe("copy_operations", None, Some(from)).await?;
        self.inner.copy_operations(from, to).await
    }

    async fn group_exists(&self, group: &GroupId) -> Result<bool, StorageError> {
        self.observe("group_exists", None, Some(group)).await?;
        self.inner.group_exists(group).await
    }

    async fn touch(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<Tick, StorageError> {
        self.observe("touch", Some(device), Some(group)).await?;
        self.inner.touch(device, user, group).await
    }

    async fn device_state(
        &self,
        device: &DeviceToken,
    ) -> Result<Option<DeviceState>, StorageError> {
        self.inner.device_state(device).await
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.inner.stats().await
    }
}
