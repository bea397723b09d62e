//! Sync orchestrator.
//!
//! Implements the group-level protocols on top of an [`OperationStore`]:
//! each one resolves the groups it touches, takes their locks, performs
//! its store calls and releases the locks on every exit path (the guards
//! do that when they drop).

use crate::config::ServiceConfig;
use crate::error::{ServiceError, SyncStep};
use crate::group_lock::{GroupGuards, GroupLocks};
use crate::storage::{LoggedOperation, OperationStore};
use crate::stream::{OperationSink, OperationSource};
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use sync_types::{DeviceToken, GroupId, Tick, UserId};
use tracing::{debug, info, warn};

/// Result of a completed SyncData exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Group the exchange ran against.
    pub group: GroupId,
    /// Operations sent to the device.
    pub delivered: u64,
    /// Operations received from the device and recorded.
    pub received: u64,
    /// Operations removed by conflict compaction.
    pub compacted: u64,
    /// The device's new sync cursor.
    pub last_sync: Tick,
}

/// Result of a completed JoinGroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The group the device is now in.
    pub group: GroupId,
    /// Operations sent to the device (group history, then pending ones).
    pub delivered: u64,
    /// Operations moved from the old group (merge).
    pub migrated: u64,
    /// Operations dropped from the old group (no merge).
    pub discarded: u64,
}

/// Result of a completed LeaveGroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The group the device left.
    pub left: GroupId,
    /// The device's own group, which it is now in.
    pub group: GroupId,
    /// Operations copied into the own group.
    pub copied: u64,
}

/// The orchestrator.
pub struct SyncService {
    store: Arc<dyn OperationStore>,
    locks: GroupLocks,
    pool: WorkerPool,
    lock_timeout: Option<Duration>,
}

impl SyncService {
    /// Build the service and spawn its ingestion workers.
    pub fn new(store: Arc<dyn OperationStore>, config: &ServiceConfig) -> Self {
        let pool = WorkerPool::new(config.workers, config.queue_capacity, Arc::clone(&store));
        Self {
            store,
            locks: GroupLocks::new(),
            pool,
            lock_timeout: config.lock_timeout(),
        }
    }

    /// Bidirectional sync of the device's current group.
    ///
    /// `inbound` is drained by a pooled worker while unsynced operations
    /// go out through `outbound`; both happen under one hold of the group
    /// lock, and the lock is not released before the drain finishes, even
    /// if this future is dropped.
    ///
    /// A failed drain does not fail the call: whatever was recorded before
    /// the failure is compacted and the cursor advances. A failed delivery
    /// does fail it, before compaction and before the cursor moves.
    pub async fn sync_data(
        &self,
        device: &DeviceToken,
        user: &UserId,
        inbound: Box<dyn OperationSource>,
        outbound: &mut dyn OperationSink,
    ) -> Result<SyncOutcome, ServiceError> {
        let (group, guards) = self
            .lock_current(device, user, |group| Ok(vec![group.clone()]))
            .await?;

        let mut drain = self
            .pool
            .submit(inbound, device.clone(), group.clone())
            .await?
            .hold(guards);

        let delivery = async {
            let unsynced = self
                .store
                .fetch_unsynced(device, &group)
                .await
                .map_err(ServiceError::store(SyncStep::FetchUnsynced))?;
            deliver(&unsynced, outbound).await
        }
        .await;

        let report = drain.wait().await;
        if let Some(e) = &report.error {
            warn!(device = %device, group = %group, error = %e, "Inbound drain stopped early");
        }

        let delivered = delivery?;

        let compacted = self
            .store
            .compact_conflicts(device, &group)
            .await
            .map_err(ServiceError::store(SyncStep::CompactConflicts))?;

        let last_sync = self
            .store
            .touch(device, user, &group)
            .await
            .map_err(ServiceError::store(SyncStep::Touch))?;

        info!(
            device = %device,
            group = %group,
            delivered,
            received = report.operations,
            compacted,
            last_sync = %last_sync,
            "Sync completed"
        );

        Ok(SyncOutcome {
            group,
            delivered,
            received: report.operations,
            compacted,
            last_sync,
        })
    }

    /// Move the device into `target`.
    ///
    /// The target's history is delivered first. With `merge_data` the
    /// device's unsynced operations from its old group follow and the old
    /// group's log moves into `target`; without it the old group's log is
    /// discarded.
    pub async fn join_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
        target: &GroupId,
        merge_data: bool,
        outbound: &mut dyn OperationSink,
    ) -> Result<JoinOutcome, ServiceError> {
        let exists = self
            .store
            .group_exists(target)
            .await
            .map_err(ServiceError::store(SyncStep::CheckGroup))?;
        if !exists {
            return Err(ServiceError::GroupNotFound {
                group: target.clone(),
            });
        }

        let (current, _guards) = self
            .lock_current(device, user, |current| {
                if current == target {
                    Err(ServiceError::AlreadyInGroup {
                        group: current.clone(),
                    })
                } else {
                    Ok(vec![target.clone(), current.clone()])
                }
            })
            .await?;

        let history = self
            .store
            .fetch_all(target)
            .await
            .map_err(ServiceError::store(SyncStep::FetchAll))?;
        let mut delivered = deliver(&history, outbound).await?;

        let mut outcome = JoinOutcome {
            group: target.clone(),
            delivered: 0,
            migrated: 0,
            discarded: 0,
        };

        if merge_data {
            let pending = self
                .store
                .fetch_unsynced(device, &current)
                .await
                .map_err(ServiceError::store(SyncStep::FetchUnsynced))?;
            delivered += deliver(&pending, outbound).await?;

            outcome.migrated = self
                .store
                .migrate_operations(&current, target)
                .await
                .map_err(ServiceError::store(SyncStep::MigrateOperations))?;
        } else {
            outcome.discarded = self
                .store
                .delete_operations(&current)
                .await
                .map_err(ServiceError::store(SyncStep::DeleteOperations))?;
        }

        self.store
            .reassign_group(device, user, target)
            .await
            .map_err(ServiceError::store(SyncStep::ReassignGroup))?;
        self.store
            .touch(device, user, target)
            .await
            .map_err(ServiceError::store(SyncStep::Touch))?;

        outcome.delivered = delivered;
        info!(
            device = %device,
            from = %current,
            to = %target,
            merge_data,
            delivered,
            migrated = outcome.migrated,
            discarded = outcome.discarded,
            "Device joined group"
        );
        Ok(outcome)
    }

    /// Move the device back into its user's own group.
    ///
    /// With `copy_data` the left group's log is duplicated into the own
    /// group; the left group keeps its copy either way.
    pub async fn leave_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
        copy_data: bool,
    ) -> Result<LeaveOutcome, ServiceError> {
        let own = GroupId::own(user);

        // The copy writes into the own group, so it is locked too.
        let (current, _guards) = self
            .lock_current(device, user, |current| {
                if current.is_own_group_of(user) {
                    Err(ServiceError::NotInGroup)
                } else {
                    Ok(vec![current.clone(), own.clone()])
                }
            })
            .await?;

        let copied = if copy_data {
            self.store
                .copy_operations(&current, &own)
                .await
                .map_err(ServiceError::store(SyncStep::CopyOperations))?
        } else {
            0
        };

        self.store
            .reassign_group(device, user, &own)
            .await
            .map_err(ServiceError::store(SyncStep::ReassignGroup))?;

        info!(device = %device, left = %current, copy_data, copied, "Device left group");
        Ok(LeaveOutcome {
            left: current,
            group: own,
            copied,
        })
    }

    /// The device's current group.
    pub async fn current_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
    ) -> Result<GroupId, ServiceError> {
        self.resolve(device, user).await
    }

    /// The lock registry.
    pub fn locks(&self) -> &GroupLocks {
        &self.locks
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    /// Inbound drains waiting for a worker.
    pub fn queued_drains(&self) -> usize {
        self.pool.queued()
    }

    /// Stop accepting new inbound drains and wait for the queued ones.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Resolve the device's group and lock it along with whatever
    /// `groups_for` adds.
    ///
    /// The group is resolved again once the locks are held. If another
    /// protocol moved the device in the meantime, the locks are dropped
    /// and the new group is tried instead.
    async fn lock_current<F>(
        &self,
        device: &DeviceToken,
        user: &UserId,
        groups_for: F,
    ) -> Result<(GroupId, GroupGuards), ServiceError>
    where
        F: Fn(&GroupId) -> Result<Vec<GroupId>, ServiceError>,
    {
        let mut group = self.resolve(device, user).await?;
        loop {
            let guards = self.acquire(&groups_for(&group)?).await?;
            let now = self.resolve(device, user).await?;
            if now == group {
                return Ok((group, guards));
            }
            debug!(device = %device, from = %group, to = %now, "Device moved while waiting for lock");
            drop(guards);
            group = now;
        }
    }

    async fn resolve(&self, device: &DeviceToken, user: &UserId) -> Result<GroupId, ServiceError> {
        self.store
            .resolve_group(device, user)
            .await
            .map_err(ServiceError::store(SyncStep::ResolveGroup))
    }

    async fn acquire(&self, groups: &[GroupId]) -> Result<GroupGuards, ServiceError> {
        let guards = self
            .locks
            .lock_many_timeout(groups, self.lock_timeout)
            .await
            .ok_or_else(|| ServiceError::LockTimeout {
                groups: groups.to_vec(),
            })?;
        debug!(groups = ?groups, "Acquired group locks");
        Ok(guards)
    }
}

async fn deliver(
    operations: &[LoggedOperation],
    outbound: &mut dyn OperationSink,
) -> Result<u64, ServiceError> {
    for logged in operations {
        outbound
            .send(&logged.operation)
            .await
            .map_err(ServiceError::stream(SyncStep::DeliverOperations))?;
    }
    Ok(operations.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::RecordingStore;
    use crate::storage::MemoryStore;
    use crate::stream::testing::{ChannelSource, VecSink};
    use sync_types::{Operation, OperationType};

    fn create(entity: &str) -> Operation {
        Operation::new(OperationType::Create, "INSERT INTO notes (id) VALUES (?)")
            .with_arguments(format!("[\"{entity}\"]"))
            .with_entity(entity, "notes")
    }

    fn delete(entity: &str) -> Operation {
        Operation::new(OperationType::Delete, "DELETE FROM notes WHERE id = ?")
            .with_arguments(format!("[\"{entity}\"]"))
            .with_entity(entity, "notes")
    }

    fn service(store: Arc<dyn OperationStore>) -> SyncService {
        SyncService::new(store, &ServiceConfig::default())
    }

    fn inbound(batches: Vec<Vec<Operation>>) -> Box<dyn OperationSource> {
        Box::new(ChannelSource::from_batches(batches))
    }

    fn nothing() -> Box<dyn OperationSource> {
        inbound(vec![])
    }

    struct Device {
        token: DeviceToken,
        user: UserId,
    }

    impl Device {
        fn new(token: &str, user: &str) -> Self {
            Self {
                token: DeviceToken::new(token),
                user: UserId::new(user),
            }
        }

        async fn sync(&self, service: &SyncService, batches: Vec<Vec<Operation>>) -> Vec<Operation> {
            let mut sink = VecSink::default();
            service
                .sync_data(&self.token, &self.user, inbound(batches), &mut sink)
                .await
                .unwrap();
            sink.sent
        }
    }

    #[tokio::test]
    async fn sync_exchanges_both_directions() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u1");

        assert!(d1.sync(&service, vec![vec![create("n1")]]).await.is_empty());

        let mut sink = VecSink::default();
        let outcome = service
            .sync_data(&d2.token, &d2.user, inbound(vec![vec![create("n2")]]), &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.sent, vec![create("n1")]);
        assert_eq!(outcome.group, GroupId::new("u1"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.received, 1);

        assert_eq!(d1.sync(&service, vec![]).await, vec![create("n2")]);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn sync_steps_run_in_protocol_order() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");

        d1.sync(&service, vec![vec![create("n1")], vec![create("n2")]])
            .await;

        let calls = store.call_names();
        assert_eq!(calls.first(), Some(&"resolve_group"));
        assert_eq!(&calls[calls.len() - 2..], &["compact_conflicts", "touch"]);
        assert_eq!(
            calls.iter().filter(|c| **c == "record_operations").count(),
            2
        );
        assert!(calls.contains(&"fetch_unsynced"));
    }

    #[tokio::test]
    async fn resync_without_new_writes_delivers_nothing() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u1");

        d1.sync(&service, vec![vec![create("n1"), create("n2")]])
            .await;
        assert_eq!(d2.sync(&service, vec![]).await.len(), 2);
        assert!(d2.sync(&service, vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_skips_compaction_and_cursor() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u1");

        d1.sync(&service, vec![vec![create("n1"), create("n2")]])
            .await;
        store.clear();

        let mut sink = VecSink::failing_after(1);
        let err = service
            .sync_data(&d2.token, &d2.user, inbound(vec![vec![create("n3")]]), &mut sink)
            .await
            .unwrap_err();

        assert_eq!(err.step(), Some(SyncStep::DeliverOperations));
        let calls = store.call_names();
        // The drain was still awaited, and its batch stays recorded.
        assert!(calls.contains(&"record_operations"));
        assert!(!calls.contains(&"compact_conflicts"));
        assert!(!calls.contains(&"touch"));
        assert!(service.locks().is_empty());

        // Nothing was acknowledged, so the retry sees the same window.
        assert_eq!(d2.sync(&service, vec![]).await.len(), 2);
    }

    #[tokio::test]
    async fn peer_disconnect_still_compacts_and_touches() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");

        let (tx, source) = ChannelSource::new();
        tx.send(Ok(Some(vec![create("x")]))).await.unwrap();
        tx.send(Ok(Some(vec![delete("x")]))).await.unwrap();
        drop(tx);

        let mut sink = VecSink::default();
        let outcome = service
            .sync_data(&d1.token, &d1.user, Box::new(source), &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome.received, 2);
        let calls = store.call_names();
        assert_eq!(&calls[calls.len() - 2..], &["compact_conflicts", "touch"]);
    }

    #[tokio::test]
    async fn store_failure_names_step_and_releases_lock() {
        let store = Arc::new(RecordingStore::new());
        store.fail_on("compact_conflicts");
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");

        let mut sink = VecSink::default();
        let err = service
            .sync_data(&d1.token, &d1.user, nothing(), &mut sink)
            .await
            .unwrap_err();

        assert_eq!(err.step(), Some(SyncStep::CompactConflicts));
        assert!(err.to_string().starts_with("failed to compact conflicts"));
        assert!(!store.call_names().contains(&"touch"));
        assert!(service.locks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn protocols_on_one_group_never_interleave() {
        let store = Arc::new(RecordingStore::with_delay(Duration::from_millis(1)));
        let service = Arc::new(service(store.clone()));

        let mut tasks = Vec::new();
        for i in 0..12 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                let device = Device::new(&format!("d{i}"), "u1");
                device
                    .sync(&service, vec![vec![create(&format!("n{i}"))]])
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Outside the lock only the group is resolved; every other call
        // made on behalf of one device must form a single run.
        let devices: Vec<DeviceToken> = store
            .calls()
            .into_iter()
            .filter(|call| call.name != "resolve_group")
            .filter_map(|call| call.device)
            .collect();
        let mut runs: Vec<&DeviceToken> = Vec::new();
        for device in &devices {
            if runs.last() != Some(&device) {
                assert!(!runs.contains(&device), "{device} interleaved with another sync");
                runs.push(device);
            }
        }
        assert_eq!(runs.len(), 12);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn lock_timeout_is_reported() {
        let store: Arc<dyn OperationStore> = Arc::new(MemoryStore::new());
        let config = ServiceConfig {
            lock_timeout_secs: 1,
            ..ServiceConfig::default()
        };
        let service = SyncService::new(store, &config);
        let d1 = Device::new("d1", "u1");

        let held = service.locks().lock(&GroupId::new("u1")).await;
        let mut sink = VecSink::default();
        let err = service
            .sync_data(&d1.token, &d1.user, nothing(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::LockTimeout { .. }));
        drop(held);
    }

    #[tokio::test]
    async fn join_missing_group_fails() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");

        let mut sink = VecSink::default();
        let err = service
            .join_group(&d1.token, &d1.user, &GroupId::new("nobody"), true, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::GroupNotFound { .. }));
        assert_eq!(store.call_names(), vec!["group_exists"]);
    }

    #[tokio::test]
    async fn join_current_group_fails() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        d1.sync(&service, vec![]).await;

        let mut sink = VecSink::default();
        let err = service
            .join_group(&d1.token, &d1.user, &GroupId::new("u1"), false, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyInGroup { .. }));
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn join_with_merge_moves_pending_history() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u2");
        let d3 = Device::new("d3", "u2");

        d1.sync(&service, vec![vec![create("a")]]).await;
        d2.sync(&service, vec![vec![create("b")]]).await;
        // d3 wrote something d2 has not seen yet.
        d3.sync(&service, vec![vec![create("c")]]).await;
        store.clear();

        let mut sink = VecSink::default();
        let outcome = service
            .join_group(&d2.token, &d2.user, &GroupId::new("u1"), true, &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.sent, vec![create("a"), create("c")]);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.migrated, 2);
        assert!(store.call_names().contains(&"migrate_operations"));
        assert!(!store.call_names().contains(&"delete_operations"));

        let target = store.fetch_all(&GroupId::new("u1")).await.unwrap();
        assert_eq!(target.len(), 3);
        assert!(store.fetch_all(&GroupId::new("u2")).await.unwrap().is_empty());
        assert_eq!(
            service.current_group(&d2.token, &d2.user).await.unwrap(),
            GroupId::new("u1")
        );

        // d1 receives the merged history on its next sync.
        assert_eq!(d1.sync(&service, vec![]).await, vec![create("b"), create("c")]);
    }

    #[tokio::test]
    async fn join_without_merge_discards_old_history() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u2");

        d1.sync(&service, vec![vec![create("a")]]).await;
        d2.sync(&service, vec![vec![create("b")]]).await;
        store.clear();

        let mut sink = VecSink::default();
        let outcome = service
            .join_group(&d2.token, &d2.user, &GroupId::new("u1"), false, &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.sent, vec![create("a")]);
        assert_eq!(outcome.discarded, 1);
        assert!(store.call_names().contains(&"delete_operations"));
        assert!(!store.call_names().contains(&"migrate_operations"));
        assert!(store.fetch_all(&GroupId::new("u2")).await.unwrap().is_empty());
        assert_eq!(store.fetch_all(&GroupId::new("u1")).await.unwrap().len(), 1);
        assert!(d1.sync(&service, vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn join_delivery_failure_leaves_groups_untouched() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u2");

        d1.sync(&service, vec![vec![create("a")]]).await;
        d2.sync(&service, vec![vec![create("b")]]).await;
        store.clear();

        let mut sink = VecSink::failing_after(0);
        let err = service
            .join_group(&d2.token, &d2.user, &GroupId::new("u1"), false, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some(SyncStep::DeliverOperations));
        assert!(!store.call_names().contains(&"delete_operations"));
        assert_eq!(store.fetch_all(&GroupId::new("u2")).await.unwrap().len(), 1);
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn leave_own_group_fails_without_mutation() {
        let store = Arc::new(RecordingStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");

        let err = service
            .leave_group(&d1.token, &d1.user, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotInGroup));
        assert_eq!(store.call_names(), vec!["resolve_group"]);
    }

    #[tokio::test]
    async fn leave_with_copy_keeps_both_logs() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u2");

        d1.sync(&service, vec![vec![create("a")]]).await;
        let mut sink = VecSink::default();
        service
            .join_group(&d2.token, &d2.user, &GroupId::new("u1"), true, &mut sink)
            .await
            .unwrap();

        let outcome = service.leave_group(&d2.token, &d2.user, true).await.unwrap();
        assert_eq!(outcome.left, GroupId::new("u1"));
        assert_eq!(outcome.group, GroupId::new("u2"));
        assert_eq!(outcome.copied, 1);

        assert_eq!(store.fetch_all(&GroupId::new("u1")).await.unwrap().len(), 1);
        assert_eq!(store.fetch_all(&GroupId::new("u2")).await.unwrap().len(), 1);
        assert_eq!(
            service.current_group(&d2.token, &d2.user).await.unwrap(),
            GroupId::new("u2")
        );
        // The copy predates d2's cursor, so it is not sent back.
        assert!(d2.sync(&service, vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn leave_without_copy_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u2");

        d1.sync(&service, vec![vec![create("a")]]).await;
        let mut sink = VecSink::default();
        service
            .join_group(&d2.token, &d2.user, &GroupId::new("u1"), true, &mut sink)
            .await
            .unwrap();

        let outcome = service.leave_group(&d2.token, &d2.user, false).await.unwrap();
        assert_eq!(outcome.copied, 0);
        assert!(store.fetch_all(&GroupId::new("u2")).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crossed_joins_do_not_deadlock() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));

        // Two members per group so each stays joinable after one leaves.
        for (token, user) in [("a1", "ua"), ("a2", "ua"), ("b1", "ub"), ("b2", "ub")] {
            Device::new(token, user).sync(&service, vec![]).await;
        }

        let join = |token: &'static str, user: &'static str, target: &'static str| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let device = Device::new(token, user);
                let mut sink = VecSink::default();
                service
                    .join_group(&device.token, &device.user, &GroupId::new(target), true, &mut sink)
                    .await
            })
        };

        let both = async {
            let first = join("a1", "ua", "ub");
            let second = join("b1", "ub", "ua");
            (first.await.unwrap(), second.await.unwrap())
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("crossed joins deadlocked");
        assert!(first.is_ok());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn sync_waiting_on_old_group_follows_join() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));
        let d1 = Device::new("d1", "u1");
        d1.sync(&service, vec![vec![create("a")]]).await;
        Device::new("d2", "u2").sync(&service, vec![]).await;

        let held = service.locks().lock_many(&[GroupId::new("u2")]).await;

        let join = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                let d2 = Device::new("d2", "u2");
                let mut sink = VecSink::default();
                service
                    .join_group(&d2.token, &d2.user, &GroupId::new("u1"), true, &mut sink)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Resolves u2 now, but only gets its lock after the join moved d2.
        let sync = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                let d2 = Device::new("d2", "u2");
                let mut sink = VecSink::default();
                service
                    .sync_data(&d2.token, &d2.user, inbound(vec![vec![create("late")]]), &mut sink)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        join.await.unwrap().unwrap();
        let outcome = sync.await.unwrap().unwrap();

        assert_eq!(outcome.group, GroupId::new("u1"));
        let d2 = Device::new("d2", "u2");
        assert_eq!(
            service.current_group(&d2.token, &d2.user).await.unwrap(),
            GroupId::new("u1")
        );
        let u1: Vec<Operation> = store
            .fetch_all(&GroupId::new("u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|logged| logged.operation)
            .collect();
        assert!(u1.contains(&create("late")));
        assert!(store.fetch_all(&GroupId::new("u2")).await.unwrap().is_empty());
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn queued_joins_see_the_earlier_move() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));
        Device::new("d1", "u1").sync(&service, vec![]).await;
        Device::new("d3", "u3").sync(&service, vec![]).await;
        Device::new("d2", "u2")
            .sync(&service, vec![vec![create("h")]])
            .await;

        let join = |target: &'static str| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let d2 = Device::new("d2", "u2");
                let mut sink = VecSink::default();
                service
                    .join_group(&d2.token, &d2.user, &GroupId::new(target), true, &mut sink)
                    .await
            })
        };

        let held = service.locks().lock_many(&[GroupId::new("u2")]).await;
        let first = join("u1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = join("u3");
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(first.await.unwrap().unwrap().group, GroupId::new("u1"));
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.group, GroupId::new("u3"));
        assert_eq!(second.migrated, 1);

        let d2 = Device::new("d2", "u2");
        assert_eq!(
            service.current_group(&d2.token, &d2.user).await.unwrap(),
            GroupId::new("u3")
        );
        let u3 = store.fetch_all(&GroupId::new("u3")).await.unwrap();
        assert_eq!(u3.len(), 1);
        assert_eq!(u3[0].operation, create("h"));
        assert!(store.fetch_all(&GroupId::new("u1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_join_fails_once_the_first_lands() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));
        Device::new("d1", "u1").sync(&service, vec![]).await;
        Device::new("d2", "u2").sync(&service, vec![]).await;

        let join = || {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let d2 = Device::new("d2", "u2");
                let mut sink = VecSink::default();
                service
                    .join_group(&d2.token, &d2.user, &GroupId::new("u1"), false, &mut sink)
                    .await
            })
        };

        let held = service.locks().lock_many(&[GroupId::new("u2")]).await;
        let first = join();
        let second = join();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ServiceError::AlreadyInGroup { .. }))));
    }

    #[tokio::test]
    async fn cancelled_sync_holds_lock_until_drain_ends() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(service(store.clone()));
        let (tx, source) = ChannelSource::new();

        let task = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                let d1 = Device::new("d1", "u1");
                let mut sink = VecSink::default();
                service
                    .sync_data(&d1.token, &d1.user, Box::new(source), &mut sink)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let u1 = [GroupId::new("u1")];
        let blocked = service
            .locks()
            .lock_many_timeout(&u1, Some(Duration::from_millis(20)))
            .await;
        assert!(blocked.is_none());

        tx.send(Ok(Some(vec![create("x")]))).await.unwrap();
        tx.send(Ok(None)).await.unwrap();
        let relocked = service
            .locks()
            .lock_many_timeout(&u1, Some(Duration::from_secs(1)))
            .await;
        assert!(relocked.is_some());
        assert_eq!(store.fetch_all(&u1[0]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_later_syncs() {
        let service = service(Arc::new(MemoryStore::new()));
        service.shutdown().await;

        let d1 = Device::new("d1", "u1");
        let mut sink = VecSink::default();
        let err = service
            .sync_data(&d1.token, &d1.user, nothing(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PoolClosed));
        assert!(service.locks().is_empty());
    }

    #[tokio::test]
    async fn scenario_join_with_nothing_pending() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u2");

        d1.sync(&service, vec![vec![create("a"), create("b")]]).await;
        d2.sync(&service, vec![]).await;

        let mut sink = VecSink::default();
        let outcome = service
            .join_group(&d2.token, &d2.user, &GroupId::new("u1"), true, &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.sent, vec![create("a"), create("b")]);
        assert_eq!(outcome.migrated, 0);
        assert_eq!(
            store.device_state(&d2.token).await.unwrap().unwrap().group_id,
            GroupId::new("u1")
        );

        let before = store.device_state(&d1.token).await.unwrap().unwrap().last_sync;
        assert!(d1.sync(&service, vec![]).await.is_empty());
        let after = store.device_state(&d1.token).await.unwrap().unwrap().last_sync;
        assert!(after > before);
    }

    #[tokio::test]
    async fn scenario_delete_supersedes_create() {
        let store = Arc::new(MemoryStore::new());
        let service = service(store.clone());
        let d1 = Device::new("d1", "u1");
        let d2 = Device::new("d2", "u1");

        // Separate syncs, so the create predates d1's own compaction window.
        d1.sync(&service, vec![vec![create("x")]]).await;
        d1.sync(&service, vec![vec![delete("x")]]).await;

        let mut sink = VecSink::default();
        let outcome = service
            .sync_data(&d2.token, &d2.user, nothing(), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome.compacted, 1);

        let log = store.fetch_all(&GroupId::new("u1")).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].operation, delete("x"));
    }
}
