//! The job record: one per annotation job, keyed by `job_id`.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ArchiveId, JobId, UserId};

/// Lifecycle status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Archived,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "ARCHIVED" => Ok(JobStatus::Archived),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cold-storage retrieval speed class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetrievalTier {
    /// Fast, capacity-limited.
    Expedited,
    Standard,
}

impl RetrievalTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalTier::Expedited => "EXPEDITED",
            RetrievalTier::Standard => "STANDARD",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "EXPEDITED" => Ok(RetrievalTier::Expedited),
            "STANDARD" => Ok(RetrievalTier::Standard),
            other => Err(DomainError::validation(format!("unknown retrieval tier: {other}"))),
        }
    }
}

impl core::fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket + key of an object in hot storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self, DomainError> {
        let bucket = bucket.into();
        let key = key.into();
        if bucket.trim().is_empty() {
            return Err(DomainError::validation("bucket must not be empty"));
        }
        if key.trim().is_empty() {
            return Err(DomainError::validation("key must not be empty"));
        }
        Ok(Self { bucket, key })
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl core::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Fields written when execution finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPayload {
    /// Epoch seconds.
    pub complete_time: i64,
    pub result_location: ObjectLocation,
    pub log_location: ObjectLocation,
}

/// Durable record of one annotation job.
///
/// Completion fields are present once the job has completed and are never
/// overwritten afterwards. `archive_id` and `retrieval` are present only while
/// the result lives in cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_file_name: String,
    pub input_location: ObjectLocation,
    /// Epoch seconds.
    pub submit_time: i64,
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<ObjectLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_location: Option<ObjectLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<ArchiveId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalTier>,

    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub version: u64,
}

impl Job {
    /// Create a freshly submitted job (status `PENDING`, version 0).
    pub fn submitted(
        job_id: JobId,
        user_id: UserId,
        input_file_name: impl Into<String>,
        input_location: ObjectLocation,
        submit_time: i64,
    ) -> Result<Self, DomainError> {
        let input_file_name = input_file_name.into();
        if input_file_name.trim().is_empty() {
            return Err(DomainError::validation("input_file_name must not be empty"));
        }

        Ok(Self {
            job_id,
            user_id,
            input_file_name,
            input_location,
            submit_time,
            status: JobStatus::Pending,
            complete_time: None,
            result_location: None,
            log_location: None,
            archive_id: None,
            retrieval: None,
            version: 0,
        })
    }

    pub fn is_archived(&self) -> bool {
        self.archive_id.is_some()
    }

    pub fn completion(&self) -> Option<CompletionPayload> {
        Some(CompletionPayload {
            complete_time: self.complete_time?,
            result_location: self.result_location.clone()?,
            log_location: self.log_location.clone()?,
        })
    }

    /// Check the record-level invariants.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.retrieval.is_some() && self.archive_id.is_none() {
            return Err(DomainError::invariant("retrieval set without archive_id"));
        }
        if self.archive_id.is_some() && self.status != JobStatus::Archived {
            return Err(DomainError::invariant(format!(
                "archive_id present while status is {}",
                self.status
            )));
        }
        if matches!(self.status, JobStatus::Completed | JobStatus::Archived)
            && self.completion().is_none()
        {
            return Err(DomainError::invariant(format!(
                "status {} without completion payload",
                self.status
            )));
        }
        Ok(())
    }
}
