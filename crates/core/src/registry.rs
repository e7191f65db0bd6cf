//! In-memory job registry.
//!
//! The registry owns the authoritative mutable state for every job
//! regardless of backend. It is the only resource touched by more than
//! one task; per-record write exclusivity is a protocol invariant (one
//! designated writer per record), so a single map-level lock is enough.
//! Inserting a new job is safe concurrently with updates to other jobs.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::job::{JobId, JobRecord, JobView};

/// Map from job identifier to job record. Jobs live until process
/// teardown; there is no eviction.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under the given id. Returns `false` if the id
    /// already exists (the record is left untouched in that case).
    pub async fn insert(&self, job_id: &str, record: JobRecord) -> bool {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job_id) {
            return false;
        }
        jobs.insert(job_id.to_string(), record);
        true
    }

    /// Apply a mutation to the record for `job_id`. Returns `false`
    /// (and does nothing) when the job is unknown -- events for unknown
    /// ids are ignored by design.
    pub async fn update<F>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Run a read-only closure against the record, if present.
    pub async fn read<F, R>(&self, job_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&JobRecord) -> R,
    {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(f)
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    /// Caller-facing snapshot of one job.
    pub async fn view(&self, job_id: &str) -> Option<JobView> {
        self.read(job_id, |record| record.view(job_id)).await
    }

    /// Clone all result images for a job. Only meaningful once the job
    /// reached its terminal success state.
    pub async fn images(&self, job_id: &str) -> Option<Vec<Vec<u8>>> {
        self.read(job_id, |record| record.images.clone()).await
    }

    /// Number of tracked jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
