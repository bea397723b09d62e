//! Per-group exclusive locks.
//!
//! Every mutation of a group's log or membership runs while holding that
//! group's lock. Entries are created on first use and evicted when the
//! last holder or waiter lets go, so the registry only ever contains
//! groups with activity in flight.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use sync_types::GroupId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-group locks.
#[derive(Default)]
pub struct GroupLocks {
    locks: Arc<DashMap<GroupId, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `group` is free and take it.
    pub async fn lock(&self, group: &GroupId) -> GroupGuard {
        let mutex = self
            .locks
            .entry(group.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;
        tracing::trace!(group = %group, "Group lock acquired");

        GroupGuard {
            group: group.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Take several groups at once.
    ///
    /// Locks are always taken in ascending group id order, whatever order
    /// the caller lists them in, so two callers locking the same pair can
    /// never deadlock. Duplicates are locked once.
    pub async fn lock_many(&self, groups: &[GroupId]) -> GroupGuards {
        let mut ordered: Vec<GroupId> = groups.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for group in &ordered {
            guards.push(self.lock(group).await);
        }
        GroupGuards { guards }
    }

    /// Like [`lock_many`](Self::lock_many), giving up after `timeout`.
    ///
    /// Returns `None` on expiry; any lock taken in the meantime is
    /// released.
    pub async fn lock_many_timeout(
        &self,
        groups: &[GroupId],
        timeout: Option<Duration>,
    ) -> Option<GroupGuards> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.lock_many(groups)).await.ok(),
            None => Some(self.lock_many(groups).await),
        }
    }

    /// Number of groups with a holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no group is locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop entries nobody references.
    ///
    /// Guards evict their own entry on release; this catches entries left
    /// behind by acquisitions cancelled while waiting.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }
}

/// Exclusive hold on one group. Released on drop.
pub struct GroupGuard {
    group: GroupId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<GroupId, Arc<Mutex<()>>>>,
}

impl GroupGuard {
    /// The locked group.
    pub fn group(&self) -> &GroupId {
        &self.group
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        // Release first so the strong count below only sees waiters.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.group, |_, mutex| Arc::strong_count(mutex) == 1);
        tracing::trace!(group = %self.group, "Group lock released");
    }
}

/// Hold on several groups, released together on drop.
pub struct GroupGuards {
    guards: Vec<GroupGuard>,
}

impl GroupGuards {
    /// Locked groups, in acquisition order.
    pub fn groups(&self) -> impl Iterator<Item = &GroupId> {
        self.guards.iter().map(GroupGuard::group)
    }
}

impl Drop for GroupGuards {
    fn drop(&mut self) {
        // Reverse acquisition order.
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
