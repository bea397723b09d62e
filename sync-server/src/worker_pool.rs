//! Ingestion worker pool.
//!
//! A SyncData session hands its inbound half to the pool and keeps
//! delivering outbound operations itself; a pooled worker records the
//! inbound batches meanwhile. The session waits on the returned
//! [`DrainHandle`] before it lets go of the group lock.

use crate::error::{ServiceError, SyncStep};
use crate::group_lock::GroupGuards;
use crate::storage::OperationStore;
use crate::stream::OperationSource;
use std::sync::Arc;
use sync_types::{DeviceToken, GroupId};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of draining one session's inbound stream.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Batches recorded.
    pub batches: u64,
    /// Operations recorded.
    pub operations: u64,
    /// Why draining stopped early, if it did. Batches recorded before the
    /// failure stay recorded.
    pub error: Option<ServiceError>,
}

impl DrainReport {
    fn aborted() -> Self {
        Self {
            error: Some(ServiceError::PoolClosed),
            ..Self::default()
        }
    }
}

/// Completion handle for a submitted drain.
pub struct DrainHandle {
    rx: oneshot::Receiver<DrainReport>,
}

impl DrainHandle {
    /// Wait until the worker is done with the session.
    ///
    /// Resolves exactly once. If the worker went away without reporting,
    /// the report carries [`ServiceError::PoolClosed`].
    pub async fn wait(self) -> DrainReport {
        self.rx.await.unwrap_or_else(|_| DrainReport::aborted())
    }

    /// Tie `guards` to this drain.
    ///
    /// The locks are released when the returned value drops, but never
    /// before the worker has reported, even if the waiting future is
    /// dropped first.
    pub fn hold(self, guards: GroupGuards) -> LockedDrain {
        LockedDrain {
            rx: Some(self.rx),
            guards: Some(guards),
        }
    }
}

/// A drain holding group locks. See [`DrainHandle::hold`].
pub struct LockedDrain {
    rx: Option<oneshot::Receiver<DrainReport>>,
    guards: Option<GroupGuards>,
}

impl LockedDrain {
    /// Wait until the worker is done with the session. The locks stay
    /// held until `self` drops.
    pub async fn wait(&mut self) -> DrainReport {
        let report = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or_else(|_| DrainReport::aborted()),
            None => DrainReport::aborted(),
        };
        self.rx = None;
        report
    }
}

impl Drop for LockedDrain {
    fn drop(&mut self) {
        let (Some(rx), Some(guards)) = (self.rx.take(), self.guards.take()) else {
            return;
        };
        // Still draining: hand the locks to a task that outlives the worker.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = rx.await;
                    debug!("Released group locks after abandoned drain");
                    drop(guards);
                });
            }
            Err(_) => warn!("No runtime to await abandoned drain, releasing group locks"),
        }
    }
}

struct Job {
    source: Box<dyn OperationSource>,
    device: DeviceToken,
    group: GroupId,
    done: oneshot::Sender<DrainReport>,
}

/// Fixed set of workers fed from a bounded queue.
pub struct WorkerPool {
    queue: async_channel::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` workers behind a queue of `capacity` jobs.
    ///
    /// Both values are clamped to at least one.
    pub fn new(workers: usize, capacity: usize, store: Arc<dyn OperationStore>) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));

        let workers = (0..workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, rx.clone(), Arc::clone(&store))))
            .collect();

        Self {
            queue: tx,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a session's inbound stream for draining into `group`.
    ///
    /// Waits while the queue is full.
    pub async fn submit(
        &self,
        source: Box<dyn OperationSource>,
        device: DeviceToken,
        group: GroupId,
    ) -> Result<DrainHandle, ServiceError> {
        let (done, rx) = oneshot::channel();
        let job = Job {
            source,
            device,
            group,
            done,
        };

        self.queue
            .send(job)
            .await
            .map_err(|_| ServiceError::PoolClosed)?;

        Ok(DrainHandle { rx })
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Stop accepting jobs. Workers finish what is queued, then exit.
    pub fn close(&self) -> bool {
        self.queue.close()
    }

    /// Close the queue and wait for every worker to exit.
    ///
    /// Queued drains still run to completion first.
    pub async fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        let count = workers.len();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Ingestion worker ended abnormally");
            }
        }
        info!(workers = count, "Ingestion worker pool stopped");
    }
}

async fn run_worker(
    id: usize,
    queue: async_channel::Receiver<Job>,
    store: Arc<dyn OperationStore>,
) {
    debug!(worker = id, "Ingestion worker started");

    while let Ok(job) = queue.recv().await {
        let Job {
            source,
            device,
            group,
            done,
        } = job;

        let report = drain(store.as_ref(), source, &device, &group).await;
        debug!(
            worker = id,
            device = %device,
            group = %group,
            batches = report.batches,
            operations = report.operations,
            "Inbound drain finished"
        );

        // The session may have given up waiting; nothing to do then.
        let _ = done.send(report);
    }

    debug!(worker = id, "Ingestion worker stopped");
}

async fn drain(
    store: &dyn OperationStore,
    mut source: Box<dyn OperationSource>,
    device: &DeviceToken,
    group: &GroupId,
) -> DrainReport {
    let mut report = DrainReport::default();

    loop {
        let batch = match source.next_batch().await {
            Ok(Some(batch)) => batch,
            Ok(None) => break,
            Err(e) => {
                warn!(device = %device, group = %group, error = %e, "Inbound stream failed");
                report.error = Some(ServiceError::stream(SyncStep::ReceiveOperations)(e));
                break;
            }
        };

        match store.record_operations(device, group, &batch).await {
            Ok(written) => {
                report.batches += 1;
                report.operations += written;
                debug!(device = %device, group = %group, written, "Recorded inbound batch");
            }
            Err(e) => {
                warn!(device = %device, group = %group, error = %e, "Failed to record inbound batch");
                report.error = Some(ServiceError::store(SyncStep::RecordOperations)(e));
                break;
            }
        }
    }

    report
}
