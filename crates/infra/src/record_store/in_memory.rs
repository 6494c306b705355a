//! In-memory record store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

use annoflow_core::{ExpectedState, Job, JobId, JobPatch, UserId};

use super::{sort_listing, JobRecordStore, RecordStoreError, ScanFilter};

/// `RwLock<HashMap>` store. Conditional updates run under the write lock, so
/// guard evaluation and patch application are atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> RecordStoreError {
        RecordStoreError::Storage("lock poisoned".into())
    }
}

impl JobRecordStore for InMemoryJobStore {
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, RecordStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(job_id).cloned())
    }

    fn put(&self, job: &Job) -> Result<(), RecordStoreError> {
        job.check_invariants()
            .map_err(|e| RecordStoreError::Invariant(e.to_string()))?;

        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        if jobs.contains_key(&job.job_id) {
            return Err(RecordStoreError::AlreadyExists(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn conditional_update(
        &self,
        job_id: &JobId,
        expected: &ExpectedState,
        patch: &JobPatch,
    ) -> Result<Job, RecordStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let current = jobs
            .get_mut(job_id)
            .ok_or_else(|| RecordStoreError::NotFound(job_id.clone()))?;

        if let Some(reason) = expected.mismatch(current) {
            debug!(job_id = %job_id, %reason, "conditional update rejected");
            return Err(RecordStoreError::Conflict(reason));
        }

        let mut next = current.clone();
        patch.apply_to(&mut next);
        next.version = current.version + 1;
        next.check_invariants()
            .map_err(|e| RecordStoreError::Invariant(e.to_string()))?;

        *current = next.clone();
        Ok(next)
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Job>, RecordStoreError> {
        self.scan(&ScanFilter::new().user(user_id.clone()))
    }

    fn scan(&self, filter: &ScanFilter) -> Result<Vec<Job>, RecordStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut out: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        sort_listing(&mut out);
        Ok(out)
    }
}
