//! Bounded registration queue and the workers that drain it.

use std::sync::Arc;

use kubecat_core::ServiceRegistration;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Outcome, ReconcileError, Reconciler, SyncReport};

/// Producers wait for a free worker instead of building a backlog.
pub const DEFAULT_QUEUE_CAP: usize = 1;

#[derive(Debug, thiserror::Error)]
#[error("registration queue is closed")]
pub struct QueueClosed;

pub struct RegistrationQueue;

impl RegistrationQueue {
    /// The queue closes once every `Emitter` clone is dropped.
    pub fn bounded(cap: usize) -> (Emitter, RegistrationReceiver) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Emitter { tx }, RegistrationReceiver { rx: Arc::new(Mutex::new(rx)) })
    }
}

/// Producer side, one clone per controller handler.
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::Sender<ServiceRegistration>,
}

impl Emitter {
    /// Waits while the queue is full.
    pub async fn emit(&self, reg: ServiceRegistration) -> Result<(), QueueClosed> {
        self.tx.send(reg).await.map_err(|_| QueueClosed)
    }
}

/// Consumer side shared by all workers.
#[derive(Clone)]
pub struct RegistrationReceiver {
    rx: Arc<Mutex<mpsc::Receiver<ServiceRegistration>>>,
}

impl RegistrationReceiver {
    pub async fn recv(&self) -> Option<ServiceRegistration> {
        self.rx.lock().await.recv().await
    }
}

/// Per-run totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub reconciled: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub creation_disabled: usize,
    pub failed: usize,
    pub subresource_errors: usize,
}

impl PoolSummary {
    pub fn record(&mut self, res: &Result<SyncReport, ReconcileError>) {
        self.reconciled += 1;
        match res {
            Ok(report) => {
                match report.outcome {
                    Outcome::Created => self.created += 1,
                    Outcome::Updated => self.updated += 1,
                    Outcome::Unchanged => self.unchanged += 1,
                    Outcome::CreationDisabled => self.creation_disabled += 1,
                }
                self.subresource_errors += report.errors().count();
            }
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: PoolSummary) {
        self.reconciled += other.reconciled;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.creation_disabled += other.creation_disabled;
        self.failed += other.failed;
        self.subresource_errors += other.subresource_errors;
    }
}

/// N workers, each with its own reconciler, pulling from one queue until it
/// is closed and drained.
pub struct WorkerPool {
    handles: Vec<JoinHandle<PoolSummary>>,
}

impl WorkerPool {
    pub fn spawn(workers: Vec<Reconciler>, queue: RegistrationReceiver) -> Self {
        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(id, reconciler)| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut summary = PoolSummary::default();
                    while let Some(reg) = queue.recv().await {
                        let res = reconciler.reconcile(&reg).await;
                        summary.record(&res);
                    }
                    debug!(worker = id, reconciled = summary.reconciled, "worker drained");
                    summary
                })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to drain the closed queue.
    pub async fn join(self) -> PoolSummary {
        let mut total = PoolSummary::default();
        for h in self.handles {
            match h.await {
                Ok(s) => total.merge(s),
                Err(e) => warn!(error = %e, "worker task failed"),
            }
        }
        info!(
            reconciled = total.reconciled,
            created = total.created,
            updated = total.updated,
            failed = total.failed,
            "worker pool finished"
        );
        total
    }
}
