//! Write-behind persistence for the job registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};

use super::store::JobStore;
use crate::models::Job;

enum WriteOp {
    Put(Box<Job>),
    Flush(oneshot::Sender<()>),
}

/// Hands committed job snapshots to a dedicated writer thread.
///
/// Snapshots are queued in commit order and written in that order, so a
/// record on disk is never older than one written before it. Dropping the
/// writer drains the queue before returning.
pub(crate) struct StoreWriter {
    tx: Option<mpsc::UnboundedSender<WriteOp>>,
    thread: Option<JoinHandle<()>>,
    store: Arc<dyn JobStore>,
    failures: Arc<AtomicU64>,
}

impl StoreWriter {
    pub(crate) fn spawn(store: Arc<dyn JobStore>) -> Self {
        let failures = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let thread = {
            let store = Arc::clone(&store);
            let failures = Arc::clone(&failures);
            std::thread::Builder::new()
                .name("job-store".to_string())
                .spawn(move || write_loop(store, rx, failures))
        };

        match thread {
            Ok(handle) => Self {
                tx: Some(tx),
                thread: Some(handle),
                store,
                failures,
            },
            Err(e) => {
                tracing::warn!("Failed to start job store writer, writing inline: {}", e);
                Self {
                    tx: None,
                    thread: None,
                    store,
                    failures,
                }
            }
        }
    }

    /// Queue a snapshot for writing. Never waits on the store.
    pub(crate) fn put(&self, job: &Job) {
        if let Some(tx) = &self.tx {
            if tx.send(WriteOp::Put(Box::new(job.clone()))).is_ok() {
                return;
            }
        }
        write(&*self.store, job, &self.failures);
    }

    /// Wait until every snapshot queued so far has been written.
    pub(crate) async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriteOp::Flush(done_tx)).is_ok() {
            // An Err means the writer is gone; nothing is left to wait for.
            let _ = done_rx.await;
        }
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Job store writer panicked");
            }
        }
    }
}

fn write_loop(store: Arc<dyn JobStore>, mut rx: mpsc::UnboundedReceiver<WriteOp>, failures: Arc<AtomicU64>) {
    while let Some(op) = rx.blocking_recv() {
        match op {
            WriteOp::Put(job) => write(&*store, &job, &failures),
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::trace!("Job store writer stopped");
}

/// The in-memory table stays authoritative when the store fails.
fn write(store: &dyn JobStore, job: &Job, failures: &AtomicU64) {
    if let Err(e) = store.put(job) {
        failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(job_id = %job.id, status = %job.status, "Failed to persist job: {}", e);
    }
}
