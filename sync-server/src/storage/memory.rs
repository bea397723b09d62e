//! In-process storage backend.
//!
//! Holds the whole log in a [`BTreeMap`] keyed by sequence number. Used by
//! the orchestrator tests and handy for embedding the server without a
//! database file.

use super::{unix_now, DeviceState, LoggedOperation, OperationStore, StoreStats};
use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use sync_types::{DeviceToken, GroupId, Operation, OperationType, RelatedEntity, Tick, UserId};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    clock: Tick,
    last_id: i64,
    devices: HashMap<DeviceToken, DeviceState>,
    operations: BTreeMap<i64, LoggedOperation>,
}

impl State {
    fn tick(&mut self) -> Tick {
        self.clock = self.clock.next();
        self.clock
    }

    fn last_sync(&self, device: &DeviceToken) -> Tick {
        self.devices
            .get(device)
            .map(|state| state.last_sync)
            .unwrap_or_else(Tick::zero)
    }

    fn append(&mut self, mut op: LoggedOperation) {
        self.last_id += 1;
        op.id = self.last_id;
        self.operations.insert(op.id, op);
    }

    fn live(&self, group: &GroupId) -> impl Iterator<Item = &LoggedOperation> + '_ {
        let group = group.clone();
        self.operations
            .values()
            .filter(move |op| op.group_id == group && !op.operation.is_tombstone())
    }
}

/// Operation log kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn dedup_entities(entities: &[RelatedEntity]) -> Vec<RelatedEntity> {
    let mut seen = HashSet::new();
    entities
        .iter()
        .filter(|entity| seen.insert((*entity).clone()))
        .cloned()
        .collect()
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn resolve_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
    ) -> Result<GroupId, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .devices
            .get(device)
            .map(|d| d.group_id.clone())
            .unwrap_or_else(|| GroupId::own(user)))
    }

    async fn record_operations(
        &self,
        device: &DeviceToken,
        group: &GroupId,
        operations: &[Operation],
    ) -> Result<u64, StorageError> {
        if operations.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().await;
        let created_at = state.tick();
        let recorded_at = unix_now();

        for op in operations {
            let mut operation = op.clone();
            operation.related_entities = dedup_entities(&op.related_entities);
            state.append(LoggedOperation {
                id: 0,
                device_token: device.clone(),
                group_id: group.clone(),
                operation,
                created_at,
                recorded_at,
            });
        }

        Ok(operations.len() as u64)
    }

    async fn compact_conflicts(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let last_sync = state.last_sync(device);

        // Latest DELETE sequence number per entity in this group.
        let mut latest_delete: HashMap<&RelatedEntity, i64> = HashMap::new();
        for op in state.operations.values() {
            if op.group_id == *group && op.operation.kind == OperationType::Delete {
                for entity in &op.operation.related_entities {
                    latest_delete.insert(entity, op.id);
                }
            }
        }

        let doomed: Vec<i64> = state
            .operations
            .values()
            .filter(|op| op.group_id == *group && op.created_at > last_sync)
            .filter(|op| {
                op.operation
                    .related_entities
                    .iter()
                    .any(|entity| latest_delete.get(entity).is_some_and(|&id| id > op.id))
            })
            .map(|op| op.id)
            .collect();

        for id in &doomed {
            state.operations.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn fetch_unsynced(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<Vec<LoggedOperation>, StorageError> {
        let state = self.state.lock().await;
        let last_sync = state.last_sync(device);

        Ok(state
            .live(group)
            .filter(|op| op.device_token != *device && op.created_at > last_sync)
            .cloned()
            .collect())
    }

    async fn fetch_all(&self, group: &GroupId) -> Result<Vec<LoggedOperation>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.live(group).cloned().collect())
    }

    async fn reassign_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let entry = state
            .devices
            .entry(device.clone())
            .or_insert_with(|| DeviceState {
                device_token: device.clone(),
                user_id: user.clone(),
                group_id: group.clone(),
                last_sync: Tick::zero(),
            });
        entry.user_id = user.clone();
        entry.group_id = group.clone();
        Ok(())
    }

    async fn migrate_operations(
        &self,
        from: &GroupId,
        to: &GroupId,
    ) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let created_at = state.tick();

        let mut moved = 0;
        for op in state.operations.values_mut() {
            if op.group_id == *from {
                op.group_id = to.clone();
                op.created_at = created_at;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn delete_operations(&self, group: &GroupId) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;
        let before = state.operations.len();
        state.operations.retain(|_, op| op.group_id != *group);
        Ok((before - state.operations.len()) as u64)
    }

    async fn copy_operations(&self, from: &GroupId, to: &GroupId) -> Result<u64, StorageError> {
        let mut state = self.state.lock().await;

        let copies: Vec<LoggedOperation> = state
            .operations
            .values()
            .filter(|op| op.group_id == *from)
            .map(|op| LoggedOperation {
                group_id: to.clone(),
                ..op.clone()
            })
            .collect();

        let copied = copies.len() as u64;
        for op in copies {
            state.append(op);
        }
        Ok(copied)
    }

    async fn group_exists(&self, group: &GroupId) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        Ok(state.devices.values().any(|d| d.group_id == *group))
    }

    async fn touch(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<Tick, StorageError> {
        let mut state = self.state.lock().await;
        let last_sync = state.tick();
        state.devices.insert(
            device.clone(),
            DeviceState {
                device_token: device.clone(),
                user_id: user.clone(),
                group_id: group.clone(),
                last_sync,
            },
        );
        Ok(last_sync)
    }

    async fn device_state(
        &self,
        device: &DeviceToken,
    ) -> Result<Option<DeviceState>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.devices.get(device).cloned())
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let state = self.state.lock().await;
        let groups: HashSet<&GroupId> = state.devices.values().map(|d| &d.group_id).collect();
        Ok(StoreStats {
            operations: state.operations.len() as u64,
            devices: state.devices.len() as u64,
            groups: groups.len() as u64,
        })
    }
}
