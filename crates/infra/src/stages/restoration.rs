//! Restoration: copy retrieved archives back into hot storage.

use std::sync::Arc;

use tracing::{debug, info, warn};

use annoflow_core::{ArchiveId, Job, JobStatus, Transition};
use annoflow_events::{LifecycleEvent, RetrievalReady, Topic};

use super::{apply_transition, unexpected, DeliveryContext, StageError, StageProcessor};
use crate::collaborators::{ColdStorage, ObjectStore, ProviderError};
use crate::record_store::{JobRecordStore, ScanFilter};

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub repaired: usize,
    /// Archive gone and no hot copy either; needs an operator.
    pub lost: usize,
}

pub struct RestorationStage {
    store: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    cold: Arc<dyn ColdStorage>,
    vault: String,
}

impl RestorationStage {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        cold: Arc<dyn ColdStorage>,
        vault: impl Into<String>,
    ) -> Self {
        Self {
            store,
            objects,
            cold,
            vault: vault.into(),
        }
    }

    fn restore(&self, ready: RetrievalReady) -> Result<(), StageError> {
        if !self.cold.vault_exists(&self.vault)? {
            return Err(StageError::FatalConfig(format!("vault {} does not exist", self.vault)));
        }

        let Some(job) = self.locate(&ready)? else {
            debug!(archive_id = %ready.archive_id, "archive already restored");
            return Ok(());
        };
        let result_location = job.result_location.clone().ok_or_else(|| {
            StageError::Validation(format!("archived job {} has no result location", job.job_id))
        })?;

        let bytes = self.cold.fetch(&self.vault, &ready.retrieval_job_id)?;
        self.objects.put(&result_location, &bytes)?;

        match self.cold.delete_archive(&self.vault, &ready.archive_id) {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        apply_transition(
            self.store.as_ref(),
            &job.job_id,
            &Transition::Restore {
                archive_id: ready.archive_id.clone(),
            },
        )?;
        info!(job_id = %job.job_id, archive_id = %ready.archive_id, "results restored");
        Ok(())
    }

    /// The job owning the archive. `None` when the named job was already
    /// restored.
    fn locate(&self, ready: &RetrievalReady) -> Result<Option<Job>, StageError> {
        if let Some(job_id) = &ready.job_id {
            if let Some(job) = self.store.get(job_id)? {
                if job.archive_id.as_ref() == Some(&ready.archive_id) {
                    return Ok(Some(job));
                }
                if job.archive_id.is_none() {
                    return Ok(None);
                }
            }
        }

        let mut matches = self
            .store
            .scan(&ScanFilter::new().archive_id(ready.archive_id.clone()))?;
        match matches.len() {
            0 => Err(StageError::NotFound(format!("no job holds archive {}", ready.archive_id))),
            1 => Ok(matches.pop()),
            n => Err(StageError::InvalidEvent(format!(
                "{n} jobs hold archive {}",
                ready.archive_id
            ))),
        }
    }

    /// Repair jobs whose archive was deleted after the hot copy was written
    /// but before the record was updated.
    pub fn reconcile(&self) -> Result<ReconcileReport, StageError> {
        let mut report = ReconcileReport::default();
        let archived = self
            .store
            .scan(&ScanFilter::new().status(JobStatus::Archived).archived())?;

        for job in archived {
            report.checked += 1;
            let (Some(archive_id), Some(result_location)) = (&job.archive_id, &job.result_location) else {
                continue;
            };
            if self.cold.archive_exists(&self.vault, archive_id)? {
                continue;
            }
            if self.objects.exists(result_location)? {
                self.repair(&job, archive_id)?;
                report.repaired += 1;
            } else {
                warn!(job_id = %job.job_id, archive_id = %archive_id, "archive and hot copy both missing");
                report.lost += 1;
            }
        }

        if report.repaired > 0 || report.lost > 0 {
            info!(checked = report.checked, repaired = report.repaired, lost = report.lost, "archive reconciliation");
        }
        Ok(report)
    }

    fn repair(&self, job: &Job, archive_id: &ArchiveId) -> Result<(), StageError> {
        let transition = Transition::Restore {
            archive_id: archive_id.clone(),
        };
        if apply_transition(self.store.as_ref(), &job.job_id, &transition)?.is_some() {
            info!(job_id = %job.job_id, archive_id = %archive_id, "interrupted restore completed");
        }
        Ok(())
    }
}

impl StageProcessor for RestorationStage {
    fn name(&self) -> &'static str {
        "restoration"
    }

    fn topic(&self) -> Topic {
        Topic::JobRestore
    }

    fn process(&self, event: LifecycleEvent, _ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        match event {
            LifecycleEvent::RetrievalReady(ready) => self.restore(ready),
            other => Err(unexpected(self.name(), &other)),
        }
    }
}
