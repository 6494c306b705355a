//! Job Record Store: one durable, versioned record per job.
//!
//! The store is the only shared mutable resource in the system. Every write
//! that depends on prior state goes through [`JobRecordStore::conditional_update`],
//! which evaluates an [`ExpectedState`] guard and applies a [`JobPatch`]
//! atomically, bumping the record version. There is no blind overwrite.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use annoflow_core::{
    ArchiveId, ExpectedState, Job, JobId, JobPatch, JobStatus, Transition, UserId,
};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The guard did not hold; the record was left unchanged.
    #[error("conditional update rejected: {0}")]
    Conflict(String),
    #[error("update would break record invariants: {0}")]
    Invariant(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// Backend unreachable or throttled; safe to retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Archive predicate for [`ScanFilter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArchiveFilter {
    #[default]
    Any,
    Present,
    Equals(ArchiveId),
}

/// Predicate for a full-table scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub user_id: Option<UserId>,
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub archive: ArchiveFilter,
    pub retrieval_absent: bool,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn archived(mut self) -> Self {
        self.archive = ArchiveFilter::Present;
        self
    }

    pub fn archive_id(mut self, archive_id: ArchiveId) -> Self {
        self.archive = ArchiveFilter::Equals(archive_id);
        self
    }

    pub fn without_retrieval(mut self) -> Self {
        self.retrieval_absent = true;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(user) = &self.user_id {
            if &job.user_id != user {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        let archive_ok = match &self.archive {
            ArchiveFilter::Any => true,
            ArchiveFilter::Present => job.archive_id.is_some(),
            ArchiveFilter::Equals(id) => job.archive_id.as_ref() == Some(id),
        };
        archive_ok && !(self.retrieval_absent && job.retrieval.is_some())
    }
}

/// Persistence contract for job records.
///
/// `query_by_user` and `scan` return records ordered by `submit_time`
/// descending, then `job_id`.
pub trait JobRecordStore: Send + Sync {
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, RecordStoreError>;

    /// Create a record; fails with `AlreadyExists` if the id is taken.
    fn put(&self, job: &Job) -> Result<(), RecordStoreError>;

    /// Apply `patch` only if the stored record satisfies `expected`.
    ///
    /// Returns the updated record. `NotFound` if there is no record,
    /// `Conflict` if the guard failed.
    fn conditional_update(
        &self,
        job_id: &JobId,
        expected: &ExpectedState,
        patch: &JobPatch,
    ) -> Result<Job, RecordStoreError>;

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Job>, RecordStoreError>;

    fn scan(&self, filter: &ScanFilter) -> Result<Vec<Job>, RecordStoreError>;

    fn transition(&self, job_id: &JobId, transition: &Transition) -> Result<Job, RecordStoreError> {
        self.conditional_update(job_id, &transition.guard(), &transition.patch())
    }
}

impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, RecordStoreError> {
        (**self).get(job_id)
    }

    fn put(&self, job: &Job) -> Result<(), RecordStoreError> {
        (**self).put(job)
    }

    fn conditional_update(
        &self,
        job_id: &JobId,
        expected: &ExpectedState,
        patch: &JobPatch,
    ) -> Result<Job, RecordStoreError> {
        (**self).conditional_update(job_id, expected, patch)
    }

    fn query_by_user(&self, user_id: &UserId) -> Result<Vec<Job>, RecordStoreError> {
        (**self).query_by_user(user_id)
    }

    fn scan(&self, filter: &ScanFilter) -> Result<Vec<Job>, RecordStoreError> {
        (**self).scan(filter)
    }
}

pub(crate) fn sort_listing(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        b.submit_time
            .cmp(&a.submit_time)
            .then_with(|| a.job_id.as_str().cmp(b.job_id.as_str()))
    });
}
