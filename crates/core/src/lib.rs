//! `annoflow-core`: the job record and its lifecycle rules.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod job;
pub mod lifecycle;

pub use error::{DomainError, DomainResult};
pub use id::{ArchiveId, JobId, RetrievalJobId, UserId};
pub use job::{CompletionPayload, Job, JobStatus, ObjectLocation, RetrievalTier};
pub use lifecycle::{
    is_legal_edge, ArchiveExpectation, ExpectedState, ExpectedVersion, FieldUpdate, JobPatch,
    RetrievalExpectation, Transition,
};
