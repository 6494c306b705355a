//! External collaborators, specified at their interface boundary.
//!
//! Each contract is a small synchronous trait with an in-memory
//! implementation for tests/dev and, where it makes sense locally, a real
//! adapter (Postgres accounts, filesystem object store, child processes).

pub mod accounts;
pub mod annotator;
pub mod cold_storage;
pub mod mailer;
pub mod object_store;
pub mod orchestrator;

pub use accounts::{AccountDirectory, InMemoryAccounts, PostgresAccounts, UserProfile, UserRole};
pub use annotator::{AnnotationRunner, ExitOutcome, LaunchOutcome, ProcessRunner};
pub use cold_storage::{ColdStorage, FsColdStorage, InMemoryColdStorage};
pub use mailer::{InMemoryMailer, LogMailer, Mail, Mailer};
pub use object_store::{FsObjectStore, InMemoryObjectStore, ObjectStore};
pub use orchestrator::{
    ArchivalOrchestrator, ArchiveRequest, ExecutionStatus, ExecutionSummary, LocalOrchestrator,
    StartOutcome,
};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The referenced object, archive or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A capacity-limited tier is exhausted; a slower tier may still work.
    #[error("insufficient capacity: {0}")]
    Capacity(String),
    /// Network failure or throttling; retrying later may succeed.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// A required resource (vault, state machine, table) is missing.
    #[error("missing resource: {0}")]
    MissingResource(String),
    /// The provider refused the request and will keep refusing it.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Replace `path` with `bytes` so readers never see a partial file.
pub(crate) fn write_atomically(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
