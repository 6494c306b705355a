//! Archival: move a free user's results from hot storage into the vault.
//!
//! [`ArchivalStage`] only starts a named, delayed orchestrator execution per
//! job. The execution body, [`ArchiveWorkflow::run`], does the actual work
//! once the grace period has passed and re-checks everything first: the
//! user may have upgraded, or a duplicate execution may have won.

use std::sync::Arc;

use tracing::{debug, info, warn};

use annoflow_core::{JobStatus, Transition};
use annoflow_events::{ArchiveCandidate, LifecycleEvent, Topic};

use super::{apply_transition, unexpected, DeliveryContext, StageError, StageProcessor};
use crate::collaborators::{
    AccountDirectory, ArchivalOrchestrator, ArchiveRequest, ColdStorage, ObjectStore, StartOutcome,
};
use crate::record_store::JobRecordStore;

fn require_vault(cold: &dyn ColdStorage, vault: &str) -> Result<(), StageError> {
    if cold.vault_exists(vault)? {
        Ok(())
    } else {
        Err(StageError::FatalConfig(format!("vault {vault} does not exist")))
    }
}

pub struct ArchivalStage {
    accounts: Arc<dyn AccountDirectory>,
    cold: Arc<dyn ColdStorage>,
    orchestrator: Arc<dyn ArchivalOrchestrator>,
    vault: String,
}

impl ArchivalStage {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        cold: Arc<dyn ColdStorage>,
        orchestrator: Arc<dyn ArchivalOrchestrator>,
        vault: impl Into<String>,
    ) -> Self {
        Self {
            accounts,
            cold,
            orchestrator,
            vault: vault.into(),
        }
    }

    fn schedule(&self, candidate: ArchiveCandidate) -> Result<(), StageError> {
        let profile = self.accounts.get_user_profile(&candidate.user_id)?;
        if !profile.is_free() {
            debug!(job_id = %candidate.job_id, user_id = %candidate.user_id, "premium user; not archiving");
            return Ok(());
        }

        require_vault(self.cold.as_ref(), &self.vault)?;
        if !self.orchestrator.is_available()? {
            return Err(StageError::FatalConfig("archival workflow is not defined".into()));
        }

        let request = ArchiveRequest {
            job_id: candidate.job_id,
            user_id: candidate.user_id,
            result_location: candidate.result_location,
        };
        let job_id = request.job_id.clone();
        match self.orchestrator.start_execution(request)? {
            StartOutcome::Started => info!(job_id = %job_id, "archival scheduled"),
            StartOutcome::AlreadyExists => debug!(job_id = %job_id, "archival already scheduled"),
        }
        Ok(())
    }
}

impl StageProcessor for ArchivalStage {
    fn name(&self) -> &'static str {
        "archival"
    }

    fn topic(&self) -> Topic {
        Topic::JobArchive
    }

    fn process(&self, event: LifecycleEvent, _ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        match event {
            LifecycleEvent::ArchiveCandidate(candidate) => self.schedule(candidate),
            other => Err(unexpected(self.name(), &other)),
        }
    }
}

/// Body of an archival execution.
pub struct ArchiveWorkflow {
    store: Arc<dyn JobRecordStore>,
    accounts: Arc<dyn AccountDirectory>,
    objects: Arc<dyn ObjectStore>,
    cold: Arc<dyn ColdStorage>,
    vault: String,
}

impl ArchiveWorkflow {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        accounts: Arc<dyn AccountDirectory>,
        objects: Arc<dyn ObjectStore>,
        cold: Arc<dyn ColdStorage>,
        vault: impl Into<String>,
    ) -> Self {
        Self {
            store,
            accounts,
            objects,
            cold,
            vault: vault.into(),
        }
    }

    pub fn run(&self, request: &ArchiveRequest) -> Result<(), StageError> {
        let job = self
            .store
            .get(&request.job_id)?
            .ok_or_else(|| StageError::NotFound(format!("job {}", request.job_id)))?;
        if job.status != JobStatus::Completed || job.archive_id.is_some() {
            debug!(job_id = %job.job_id, status = %job.status, "nothing to archive");
            return Ok(());
        }

        // The user may have upgraded during the grace period.
        let profile = self.accounts.get_user_profile(&job.user_id)?;
        if !profile.is_free() {
            info!(job_id = %job.job_id, user_id = %job.user_id, "user upgraded; archive skipped");
            return Ok(());
        }

        require_vault(self.cold.as_ref(), &self.vault)?;

        let result_location = job.result_location.clone().ok_or_else(|| {
            StageError::Validation(format!("completed job {} has no result location", job.job_id))
        })?;
        let bytes = self.objects.get(&result_location)?;
        let archive_id = self
            .cold
            .upload_archive(&self.vault, &bytes, job.job_id.as_str())?;

        let transition = Transition::Archive {
            archive_id: archive_id.clone(),
        };
        if apply_transition(self.store.as_ref(), &job.job_id, &transition)?.is_none() {
            // Someone else archived (or the record moved on); drop our copy.
            if let Err(e) = self.cold.delete_archive(&self.vault, &archive_id) {
                warn!(job_id = %job.job_id, archive_id = %archive_id, error = %e, "failed to remove orphan archive");
            }
            return Ok(());
        }

        self.objects.delete(&result_location)?;
        info!(job_id = %job.job_id, archive_id = %archive_id, "results archived");
        Ok(())
    }
}
