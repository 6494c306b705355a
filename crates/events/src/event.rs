//! Typed lifecycle events exchanged between stages.
//!
//! Each stage consumes exactly one event kind from its own queue. Events are
//! decoded and validated once at ingress (see [`crate::envelope`]); stage
//! processors only ever see a well-formed [`LifecycleEvent`].

use serde::{Deserialize, Serialize};

use annoflow_core::{ArchiveId, DomainError, JobId, ObjectLocation, RetrievalJobId, UserId};

/// An input object finished uploading; a job should be created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCompleted {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_file_name: String,
    pub input_location: ObjectLocation,
}

/// A job record was created and is waiting for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequested {
    pub job_id: JobId,
    pub user_id: UserId,
    pub input_file_name: String,
    pub input_location: ObjectLocation,
    pub submit_time: i64,
}

/// Annotation finished; the owner should be told.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsReady {
    pub job_id: JobId,
    pub user_id: UserId,
    pub complete_time: i64,
}

/// A completed result that may be moved to cold storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCandidate {
    pub job_id: JobId,
    pub user_id: UserId,
    pub result_location: ObjectLocation,
}

/// A user moved to the premium tier; archived results should be thawed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequested {
    pub user_id: UserId,
}

/// A cold-storage retrieval succeeded and its output can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalReady {
    pub archive_id: ArchiveId,
    pub retrieval_job_id: RetrievalJobId,
    /// Job that requested the retrieval, when the provider echoed it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// Discriminant of [`LifecycleEvent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UploadCompleted,
    JobRequested,
    ResultsReady,
    ArchiveCandidate,
    UpgradeRequested,
    RetrievalReady,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UploadCompleted => "upload_completed",
            EventKind::JobRequested => "job_requested",
            EventKind::ResultsReady => "results_ready",
            EventKind::ArchiveCandidate => "archive_candidate",
            EventKind::UpgradeRequested => "upgrade_requested",
            EventKind::RetrievalReady => "retrieval_ready",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every message that flows between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    UploadCompleted(UploadCompleted),
    JobRequested(JobRequested),
    ResultsReady(ResultsReady),
    ArchiveCandidate(ArchiveCandidate),
    UpgradeRequested(UpgradeRequested),
    RetrievalReady(RetrievalReady),
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::UploadCompleted(_) => EventKind::UploadCompleted,
            LifecycleEvent::JobRequested(_) => EventKind::JobRequested,
            LifecycleEvent::ResultsReady(_) => EventKind::ResultsReady,
            LifecycleEvent::ArchiveCandidate(_) => EventKind::ArchiveCandidate,
            LifecycleEvent::UpgradeRequested(_) => EventKind::UpgradeRequested,
            LifecycleEvent::RetrievalReady(_) => EventKind::RetrievalReady,
        }
    }

    /// The job this event concerns, if it names one.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            LifecycleEvent::UploadCompleted(e) => Some(&e.job_id),
            LifecycleEvent::JobRequested(e) => Some(&e.job_id),
            LifecycleEvent::ResultsReady(e) => Some(&e.job_id),
            LifecycleEvent::ArchiveCandidate(e) => Some(&e.job_id),
            LifecycleEvent::UpgradeRequested(_) => None,
            LifecycleEvent::RetrievalReady(e) => e.job_id.as_ref(),
        }
    }

    /// Field-level checks that the type system does not already carry.
    ///
    /// Identifiers reject empty values on deserialization; free-form strings
    /// and locations are checked here.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self {
            LifecycleEvent::UploadCompleted(e) => {
                non_empty("input_file_name", &e.input_file_name)?;
                location("input_location", &e.input_location)
            }
            LifecycleEvent::JobRequested(e) => {
                non_empty("input_file_name", &e.input_file_name)?;
                location("input_location", &e.input_location)?;
                if e.submit_time < 0 {
                    return Err(DomainError::validation("submit_time must not be negative"));
                }
                Ok(())
            }
            LifecycleEvent::ResultsReady(e) => {
                if e.complete_time < 0 {
                    return Err(DomainError::validation("complete_time must not be negative"));
                }
                Ok(())
            }
            LifecycleEvent::ArchiveCandidate(e) => location("result_location", &e.result_location),
            LifecycleEvent::UpgradeRequested(_) | LifecycleEvent::RetrievalReady(_) => Ok(()),
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn location(field: &str, loc: &ObjectLocation) -> Result<(), DomainError> {
    ObjectLocation::new(loc.bucket.as_str(), loc.key.as_str())
        .map(|_| ())
        .map_err(|e| DomainError::validation(format!("{field}: {e}")))
}
