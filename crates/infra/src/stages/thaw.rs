//! Thaw: after an upgrade, cancel pending archivals and start retrievals for
//! everything already in the vault.

use std::sync::Arc;

use tracing::{debug, info, warn};

use annoflow_core::{Job, RetrievalTier, Transition, UserId};
use annoflow_events::{LifecycleEvent, Topic};

use super::{apply_transition, unexpected, DeliveryContext, StageError, StageProcessor};
use crate::collaborators::{
    AccountDirectory, ArchivalOrchestrator, ColdStorage, ProviderError,
};
use crate::record_store::{JobRecordStore, ScanFilter};

pub struct ThawStage {
    store: Arc<dyn JobRecordStore>,
    accounts: Arc<dyn AccountDirectory>,
    cold: Arc<dyn ColdStorage>,
    orchestrator: Arc<dyn ArchivalOrchestrator>,
    vault: String,
}

impl ThawStage {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        accounts: Arc<dyn AccountDirectory>,
        cold: Arc<dyn ColdStorage>,
        orchestrator: Arc<dyn ArchivalOrchestrator>,
        vault: impl Into<String>,
    ) -> Self {
        Self {
            store,
            accounts,
            cold,
            orchestrator,
            vault: vault.into(),
        }
    }

    fn thaw(&self, user_id: &UserId) -> Result<(), StageError> {
        let profile = self.accounts.get_user_profile(user_id)?;
        if profile.is_free() {
            debug!(user_id = %user_id, "user is not premium; nothing to thaw");
            return Ok(());
        }

        self.cancel_pending_archivals(user_id);

        if !self.cold.vault_exists(&self.vault)? {
            return Err(StageError::FatalConfig(format!("vault {} does not exist", self.vault)));
        }

        let archived = self.store.scan(
            &ScanFilter::new()
                .user(user_id.clone())
                .archived()
                .without_retrieval(),
        )?;

        let mut retry: Option<StageError> = None;
        for job in &archived {
            if let Err(e) = self.begin_retrieval(job) {
                e.log(self.name(), job.job_id.as_str());
                if matches!(e, StageError::Transient(_) | StageError::Capacity(_)) && retry.is_none() {
                    retry = Some(e);
                }
            }
        }

        info!(user_id = %user_id, archived = archived.len(), "thaw processed");
        // Redelivery only revisits jobs that still have no retrieval.
        retry.map_or(Ok(()), Err)
    }

    /// Advisory: a failure here only means an archival may still run.
    fn cancel_pending_archivals(&self, user_id: &UserId) {
        let running = match self.orchestrator.list_running(user_id) {
            Ok(running) => running,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "cannot list archival executions");
                return;
            }
        };
        for execution in running {
            match self.orchestrator.stop_execution(&execution.name) {
                Ok(()) => debug!(user_id = %user_id, execution = %execution.name, "archival cancelled"),
                Err(e) => warn!(user_id = %user_id, execution = %execution.name, error = %e, "failed to cancel archival"),
            }
        }
    }

    fn begin_retrieval(&self, job: &Job) -> Result<(), StageError> {
        let archive_id = job
            .archive_id
            .clone()
            .ok_or_else(|| StageError::Validation(format!("job {} has no archive", job.job_id)))?;

        let description = job.job_id.as_str();
        let (tier, retrieval_job_id) = match self.cold.initiate_retrieval(
            &self.vault,
            &archive_id,
            RetrievalTier::Expedited,
            description,
        ) {
            Ok(id) => (RetrievalTier::Expedited, id),
            Err(ProviderError::Capacity(reason)) => {
                debug!(job_id = %job.job_id, %reason, "expedited capacity exhausted; using standard");
                let id = self.cold.initiate_retrieval(
                    &self.vault,
                    &archive_id,
                    RetrievalTier::Standard,
                    description,
                )?;
                (RetrievalTier::Standard, id)
            }
            Err(e) => return Err(e.into()),
        };

        apply_transition(
            self.store.as_ref(),
            &job.job_id,
            &Transition::BeginRetrieval { archive_id, tier },
        )?;
        info!(job_id = %job.job_id, %tier, retrieval_job_id = %retrieval_job_id, "retrieval started");
        Ok(())
    }
}

impl StageProcessor for ThawStage {
    fn name(&self) -> &'static str {
        "thaw"
    }

    fn topic(&self) -> Topic {
        Topic::JobThaw
    }

    fn process(&self, event: LifecycleEvent, _ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        match event {
            LifecycleEvent::UpgradeRequested(upgrade) => self.thaw(&upgrade.user_id),
            other => Err(unexpected(self.name(), &other)),
        }
    }
}
