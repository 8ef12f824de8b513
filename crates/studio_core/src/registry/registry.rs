//! In-memory job table with write-behind persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use super::errors::{RegistryError, RegistryResult};
use super::store::{JobStore, MemoryStore};
use super::writer::StoreWriter;
use crate::models::{Job, JobId, JobStatus, JobStatusView, ResourceClass, StageStatus};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Idempotency key → id, for non-terminal jobs only.
    live_keys: HashMap<String, JobId>,
}

/// Point-in-time counts derived from the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub by_status: HashMap<JobStatus, usize>,
    pub running_by_class: HashMap<ResourceClass, usize>,
    /// Sum of reserved cost over non-terminal jobs.
    pub committed_cost: f64,
}

/// Authoritative record of every job.
///
/// All writes go through this type. Status changes are compare-and-swap
/// on the expected current status, applied under one write lock together
/// with any field updates, so readers never see a half-applied transition.
///
/// Every committed change is queued, in commit order, for a writer thread
/// that saves it to the [`JobStore`]. No registry lock is held across
/// store I/O; call [`flush`](Self::flush) to wait for the store to catch up.
pub struct JobRegistry {
    inner: RwLock<Inner>,
    store: Arc<dyn JobStore>,
    writer: StoreWriter,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            writer: StoreWriter::spawn(Arc::clone(&store)),
            store,
        }
    }

    /// Registry backed by a [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Insert a new job.
    pub fn create(&self, job: Job) -> RegistryResult<()> {
        let mut guard = self.inner.write();
        let Inner { jobs, live_keys } = &mut *guard;

        if jobs.contains_key(&job.id) {
            return Err(RegistryError::AlreadyExists(job.id));
        }
        if !job.is_terminal() {
            if let Some(existing) = live_keys.get(&job.idempotency_key) {
                return Err(RegistryError::DuplicateKey(existing.clone()));
            }
            live_keys.insert(job.idempotency_key.clone(), job.id.clone());
        }

        self.writer.put(&job);
        tracing::debug!(job_id = %job.id, status = %job.status, "Registered job");
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.read().jobs.get(id).cloned()
    }

    /// Status query view of a job.
    pub fn status(&self, id: &str) -> Option<JobStatusView> {
        self.inner.read().jobs.get(id).map(Job::status_view)
    }

    /// Live (non-terminal) job holding an idempotency key.
    pub fn live_job_for_key(&self, key: &str) -> Option<JobId> {
        self.inner.read().live_keys.get(key).cloned()
    }

    /// Compare-and-swap the status of a job.
    pub fn update_status(&self, id: &str, expected: JobStatus, new: JobStatus) -> RegistryResult<Job> {
        self.transition(id, expected, new, |_| {})
    }

    /// Compare-and-swap the status and apply `apply` in the same step.
    ///
    /// Fails with [`RegistryError::Conflict`] when the job is not in
    /// `expected`, leaving it untouched. Start and completion timestamps are
    /// stamped here; a terminal transition frees the idempotency key.
    pub fn transition<F>(&self, id: &str, expected: JobStatus, new: JobStatus, apply: F) -> RegistryResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut guard = self.inner.write();
        let Inner { jobs, live_keys } = &mut *guard;

        let job = jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if job.status != expected {
            return Err(RegistryError::Conflict {
                job_id: id.to_string(),
                expected,
                actual: job.status,
            });
        }
        if !is_allowed(expected, new) {
            return Err(RegistryError::InvalidTransition {
                job_id: id.to_string(),
                from: expected,
                to: new,
            });
        }

        let progress = job.progress;
        apply(job);
        job.status = new;
        job.progress = job.progress.max(progress).min(100);

        let now = Utc::now();
        if new == JobStatus::Running {
            job.started_at.get_or_insert(now);
        }
        if new.is_terminal() {
            job.completed_at = Some(now);
            if live_keys.get(&job.idempotency_key) == Some(&job.id) {
                live_keys.remove(&job.idempotency_key);
            }
        }

        tracing::debug!(job_id = %id, from = %expected, to = %new, "Job status changed");
        let snapshot = job.clone();
        self.writer.put(&snapshot);
        Ok(snapshot)
    }

    /// Mutate a live job without changing its status.
    ///
    /// Status is restored if `apply` touched it and progress is clamped to
    /// never decrease. Terminal jobs are rejected.
    pub fn update<F>(&self, id: &str, apply: F) -> RegistryResult<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut guard = self.inner.write();
        let job = guard
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if job.is_terminal() {
            return Err(RegistryError::Terminal {
                job_id: id.to_string(),
                status: job.status,
            });
        }

        let status = job.status;
        let progress = job.progress;
        apply(job);
        job.status = status;
        job.progress = job.progress.max(progress).min(100);

        let snapshot = job.clone();
        self.writer.put(&snapshot);
        Ok(snapshot)
    }

    pub fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .read()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().jobs.is_empty()
    }

    /// Reserved cost summed over non-terminal jobs.
    pub fn committed_cost(&self) -> f64 {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|job| !job.is_terminal())
            .map(|job| job.reserved_cost)
            .sum()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let mut snapshot = RegistrySnapshot::default();
        for job in inner.jobs.values() {
            *snapshot.by_status.entry(job.status).or_default() += 1;
            if job.status == JobStatus::Running {
                *snapshot.running_by_class.entry(job.resource_class).or_default() += 1;
            }
            if !job.is_terminal() {
                snapshot.committed_cost += job.reserved_cost;
            }
        }
        snapshot
    }

    /// Load persisted records and fail every job a previous process left
    /// unfinished. Progress is never resumed across processes.
    ///
    /// Returns the number of jobs reconciled.
    pub fn recover(&self) -> RegistryResult<usize> {
        let records = self.store.list()?;
        let mut guard = self.inner.write();
        let mut reconciled = 0;

        for mut job in records {
            if guard.jobs.contains_key(&job.id) {
                continue;
            }
            if !job.is_terminal() {
                let message = format!("interrupted by restart while {}", job.status);
                tracing::warn!(job_id = %job.id, previous = %job.status, "Reconciling unfinished job to failed");

                for stage in job.stages.iter_mut() {
                    if stage.status == StageStatus::Running {
                        stage.status = StageStatus::Failed;
                        stage.error = Some(message.clone());
                    }
                }
                job.status = JobStatus::Failed;
                job.error = Some(message);
                job.completed_at = Some(Utc::now());
                self.store.put(&job)?;
                reconciled += 1;
            }
            guard.jobs.insert(job.id.clone(), job);
        }

        tracing::info!(jobs = guard.jobs.len(), reconciled, "Recovered job registry");
        Ok(reconciled)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Wait until every change committed so far is in the store.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Number of writes the store rejected since start.
    pub fn persist_failures(&self) -> u64 {
        self.writer.failures()
    }
}

fn is_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Cancelled)
            | (Queued, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}
