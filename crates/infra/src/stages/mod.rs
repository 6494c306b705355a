//! Stage processors.
//!
//! Each stage consumes one topic, performs a bounded unit of work for one
//! job (or one user), and drives at most one lifecycle transition per job.
//! Processors are synchronous and hold no state between messages; all
//! coordination happens through conditional updates on the record store.
//!
//! Errors are classified by [`StageError::disposition`]: the poll loop either
//! deletes the message (done, or retrying cannot help) or leaves it for
//! redelivery.

pub mod archival;
pub mod execution;
pub mod notification;
pub mod restoration;
pub mod submission;
pub mod thaw;

use std::time::Duration;

use tracing::{debug, error, warn};

use annoflow_core::{DomainError, ExpectedState, Job, JobId, Transition};
use annoflow_events::{DeliveryQueue, DeliveryToken, EnvelopeError, LifecycleEvent, PublishError, Topic};

use crate::collaborators::ProviderError;
use crate::record_store::{JobRecordStore, RecordStoreError};

pub use archival::{ArchivalStage, ArchiveWorkflow};
pub use execution::{CompletionSweep, ExecutionStage, SweepReport};
pub use notification::NotificationStage;
pub use restoration::{ReconcileReport, RestorationStage};
pub use submission::{parse_upload_key, SubmissionStage};
pub use thaw::ThawStage;

/// What the poll loop does with a message after processing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    Delete,
    /// Leave undeleted; the queue redelivers after the visibility timeout.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Guard mismatch; the work was already done by someone else.
    #[error("already handled: {0}")]
    Conflict(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("insufficient capacity: {0}")]
    Capacity(String),
    #[error("missing required resource: {0}")]
    FatalConfig(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("duplicate job: {0}")]
    DuplicateJob(JobId),
}

impl StageError {
    pub fn disposition(&self) -> Disposition {
        match self {
            StageError::Transient(_) | StageError::Capacity(_) | StageError::FatalConfig(_) => {
                Disposition::Retain
            }
            StageError::Validation(_)
            | StageError::NotFound(_)
            | StageError::Conflict(_)
            | StageError::InvalidEvent(_)
            | StageError::DuplicateJob(_) => Disposition::Delete,
        }
    }

    /// Emit one log line at the level this error class warrants.
    pub fn log(&self, stage: &str, message_id: &str) {
        match self {
            StageError::Conflict(_) | StageError::DuplicateJob(_) => {
                debug!(stage, message_id, error = %self, "already handled")
            }
            StageError::FatalConfig(_) => {
                error!(stage, message_id, error = %self, "stage misconfigured; job skipped")
            }
            _ => warn!(stage, message_id, error = %self, disposition = ?self.disposition(), "stage failed"),
        }
    }
}

impl From<RecordStoreError> for StageError {
    fn from(err: RecordStoreError) -> Self {
        match err {
            RecordStoreError::NotFound(id) => StageError::NotFound(format!("job {id}")),
            RecordStoreError::AlreadyExists(id) => StageError::DuplicateJob(id),
            RecordStoreError::Conflict(reason) => StageError::Conflict(reason),
            RecordStoreError::Invariant(reason) => StageError::Validation(reason),
            RecordStoreError::Storage(reason) | RecordStoreError::Unavailable(reason) => {
                StageError::Transient(reason)
            }
        }
    }
}

impl From<ProviderError> for StageError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(what) => StageError::NotFound(what),
            ProviderError::Capacity(what) => StageError::Capacity(what),
            ProviderError::Transient(what) => StageError::Transient(what),
            ProviderError::MissingResource(what) => StageError::FatalConfig(what),
            ProviderError::Rejected(what) => StageError::Validation(what),
        }
    }
}

impl From<PublishError> for StageError {
    fn from(err: PublishError) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<EnvelopeError> for StageError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::UnexpectedKind { .. } | EnvelopeError::Rejected(_) => {
                StageError::InvalidEvent(err.to_string())
            }
            EnvelopeError::Malformed(_)
            | EnvelopeError::Invalid(_)
            | EnvelopeError::Serialization(_) => StageError::Validation(err.to_string()),
        }
    }
}

impl From<DomainError> for StageError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(reason) => StageError::Conflict(reason),
            other => StageError::Validation(other.to_string()),
        }
    }
}

/// The message being processed, for work that must touch it mid-flight.
#[derive(Clone, Copy)]
pub struct DeliveryContext<'a> {
    queue: Option<&'a dyn DeliveryQueue>,
    token: Option<&'a DeliveryToken>,
    pub receive_count: u32,
}

impl<'a> DeliveryContext<'a> {
    pub fn new(queue: &'a dyn DeliveryQueue, token: &'a DeliveryToken, receive_count: u32) -> Self {
        Self {
            queue: Some(queue),
            token: Some(token),
            receive_count,
        }
    }

    /// No backing queue (direct calls, tests).
    pub fn detached() -> Self {
        Self {
            queue: None,
            token: None,
            receive_count: 1,
        }
    }

    /// Best effort: a failed extension only makes duplicate processing more
    /// likely, which the guards already tolerate.
    pub fn extend_visibility(&self, extension: Duration) {
        if let (Some(queue), Some(token)) = (self.queue, self.token) {
            if let Err(e) = queue.extend_visibility(token, extension) {
                warn!(queue = queue.name(), error = %e, "failed to extend visibility");
            }
        }
    }
}

pub trait StageProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// The topic whose events this stage consumes.
    fn topic(&self) -> Topic;

    fn process(&self, event: LifecycleEvent, ctx: DeliveryContext<'_>) -> Result<(), StageError>;
}

/// Apply a guarded transition. A guard mismatch means another delivery got
/// there first; it is logged and reported as `Ok(None)`.
pub(crate) fn apply_transition(
    store: &dyn JobRecordStore,
    job_id: &JobId,
    transition: &Transition,
) -> Result<Option<Job>, StageError> {
    apply_guarded(store, job_id, &transition.guard(), transition)
}

/// Like [`apply_transition`] with a guard narrower than the transition's own.
pub(crate) fn apply_guarded(
    store: &dyn JobRecordStore,
    job_id: &JobId,
    guard: &ExpectedState,
    transition: &Transition,
) -> Result<Option<Job>, StageError> {
    match store.conditional_update(job_id, guard, &transition.patch()) {
        Ok(job) => Ok(Some(job)),
        Err(RecordStoreError::Conflict(reason)) => {
            debug!(job_id = %job_id, transition = transition.name(), %reason, "transition already applied");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn unexpected(stage: &str, event: &LifecycleEvent) -> StageError {
    StageError::InvalidEvent(format!("{stage} stage cannot handle {}", event.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_retained() {
        assert_eq!(StageError::Transient("x".into()).disposition(), Disposition::Retain);
        assert_eq!(StageError::Capacity("x".into()).disposition(), Disposition::Retain);
        assert_eq!(StageError::FatalConfig("x".into()).disposition(), Disposition::Retain);
    }

    #[test]
    fn unrecoverable_errors_are_deleted() {
        for err in [
            StageError::Validation("x".into()),
            StageError::NotFound("x".into()),
            StageError::Conflict("x".into()),
            StageError::InvalidEvent("x".into()),
            StageError::DuplicateJob(JobId::new("J1").unwrap()),
        ] {
            assert_eq!(err.disposition(), Disposition::Delete, "{err}");
        }
    }

    #[test]
    fn provider_errors_map_to_taxonomy() {
        assert!(matches!(
            StageError::from(ProviderError::MissingResource("vault".into())),
            StageError::FatalConfig(_)
        ));
        assert!(matches!(
            StageError::from(ProviderError::NotFound("input".into())),
            StageError::NotFound(_)
        ));
        assert!(matches!(
            StageError::from(RecordStoreError::Unavailable("db".into())),
            StageError::Transient(_)
        ));
    }

    #[test]
    fn rejected_notification_is_invalid_event() {
        let err = StageError::from(EnvelopeError::Rejected("action=InventoryRetrieval".into()));
        assert!(matches!(err, StageError::InvalidEvent(_)));
        assert_eq!(err.disposition(), Disposition::Delete);
    }
}
