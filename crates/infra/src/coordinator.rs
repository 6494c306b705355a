//! Wiring: builds every stage from one set of collaborators and runs them.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use annoflow_events::{DeliveryQueue, Publisher, Topic};

use crate::collaborators::{
    AccountDirectory, AnnotationRunner, ColdStorage, LocalOrchestrator, Mailer, ObjectStore,
};
use crate::config::CoordinatorConfig;
use crate::record_store::JobRecordStore;
use crate::stages::{
    ArchivalStage, ArchiveWorkflow, CompletionSweep, ExecutionStage, NotificationStage,
    RestorationStage, StageProcessor, SubmissionStage, ThawStage,
};
use crate::workers::{IntervalWorker, StageWorker, WorkerHandle};

/// Everything the stages talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn JobRecordStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub objects: Arc<dyn ObjectStore>,
    pub cold: Arc<dyn ColdStorage>,
    pub mailer: Arc<dyn Mailer>,
    pub runner: Arc<dyn AnnotationRunner>,
    pub orchestrator: Arc<LocalOrchestrator>,
    pub publisher: Arc<dyn Publisher>,
}

pub struct Stages {
    pub submission: Arc<SubmissionStage>,
    pub execution: Arc<ExecutionStage>,
    pub notification: Arc<NotificationStage>,
    pub archival: Arc<ArchivalStage>,
    pub thaw: Arc<ThawStage>,
    pub restoration: Arc<RestorationStage>,
    pub sweep: Arc<CompletionSweep>,
    pub workflow: Arc<ArchiveWorkflow>,
}

impl Stages {
    pub fn new(c: &Collaborators, config: &CoordinatorConfig) -> Self {
        let vault = config.storage.vault.as_str();
        Self {
            submission: Arc::new(SubmissionStage::new(c.store.clone(), c.publisher.clone())),
            execution: Arc::new(ExecutionStage::new(
                c.store.clone(),
                c.objects.clone(),
                c.runner.clone(),
                &config.annotator,
                &config.poll,
            )),
            notification: Arc::new(NotificationStage::new(
                c.accounts.clone(),
                c.mailer.clone(),
                &config.notify,
            )),
            archival: Arc::new(ArchivalStage::new(
                c.accounts.clone(),
                c.cold.clone(),
                c.orchestrator.clone(),
                vault,
            )),
            thaw: Arc::new(ThawStage::new(
                c.store.clone(),
                c.accounts.clone(),
                c.cold.clone(),
                c.orchestrator.clone(),
                vault,
            )),
            restoration: Arc::new(RestorationStage::new(
                c.store.clone(),
                c.objects.clone(),
                c.cold.clone(),
                vault,
            )),
            sweep: Arc::new(CompletionSweep::new(
                c.store.clone(),
                c.objects.clone(),
                c.runner.clone(),
                c.publisher.clone(),
                &config.annotator,
                &config.storage,
            )),
            workflow: Arc::new(ArchiveWorkflow::new(
                c.store.clone(),
                c.accounts.clone(),
                c.objects.clone(),
                c.cold.clone(),
                vault,
            )),
        }
    }

    /// The queue-driven stages, one per consumed topic.
    pub fn processors(&self) -> Vec<Arc<dyn StageProcessor>> {
        vec![
            self.submission.clone() as Arc<dyn StageProcessor>,
            self.execution.clone(),
            self.notification.clone(),
            self.archival.clone(),
            self.thaw.clone(),
            self.restoration.clone(),
        ]
    }
}

/// Running workers. Dropping this without [`shutdown`](Self::shutdown)
/// detaches them.
pub struct Coordinator {
    handles: Vec<WorkerHandle>,
}

impl Coordinator {
    /// Start a poll loop per stage plus the sweep, orchestrator and
    /// reconciliation tickers.
    ///
    /// `queue_for` supplies the queue a stage consumes from, given the topic
    /// and the stage name.
    pub fn start<Q>(
        stages: &Stages,
        orchestrator: Arc<LocalOrchestrator>,
        config: &CoordinatorConfig,
        mut queue_for: Q,
    ) -> anyhow::Result<Self>
    where
        Q: FnMut(Topic, &'static str) -> anyhow::Result<Arc<dyn DeliveryQueue>>,
    {
        let mut handles = Vec::new();
        let options = config.poll.receive_options();

        for processor in stages.processors() {
            let queue = queue_for(processor.topic(), processor.name())
                .with_context(|| format!("queue for stage {}", processor.name()))?;
            handles.push(StageWorker::spawn(queue, processor, options)?);
        }

        let sweep = stages.sweep.clone();
        handles.push(IntervalWorker::spawn(
            "completion-sweep",
            config.annotator.sweep_interval,
            move || {
                let report = sweep.run();
                if report.completed > 0 || report.failed > 0 {
                    info!(completed = report.completed, failed = report.failed, pending = report.pending, "completion sweep");
                }
            },
        )?);

        let workflow = stages.workflow.clone();
        handles.push(IntervalWorker::spawn(
            "archival-executions",
            config.archive.tick_interval,
            move || {
                orchestrator.run_due(|request| workflow.run(request));
            },
        )?);

        let restoration = stages.restoration.clone();
        handles.push(IntervalWorker::spawn(
            "archive-reconcile",
            config.archive.reconcile_interval,
            move || {
                if let Err(e) = restoration.reconcile() {
                    warn!(error = %e, "archive reconciliation failed");
                }
            },
        )?);

        info!(workers = handles.len(), "coordinator started");
        Ok(Self { handles })
    }

    /// Add a worker whose lifetime should follow the coordinator's.
    pub fn attach(&mut self, handle: WorkerHandle) {
        self.handles.push(handle);
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            let name = handle.name().to_string();
            handle.shutdown();
            info!(worker = %name, "worker stopped");
        }
    }
}
