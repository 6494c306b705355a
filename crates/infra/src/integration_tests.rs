//! End-to-end lifecycle over the in-memory adapters.
//!
//! Upload → submission → execution → completion sweep → notification and
//! archival → upgrade → thaw → retrieval → restoration, with queues pumped
//! synchronously so every step is deterministic.

use std::sync::Arc;
use std::time::Duration;

use annoflow_core::{JobId, JobStatus, ObjectLocation, RetrievalTier, UserId};
use annoflow_events::{
    InMemoryQueue, InMemoryTopics, LifecycleEvent, Publisher, ReceiveOptions, Topic,
    UpgradeRequested, UploadCompleted,
};

use crate::collaborators::annotator::testing::InstantRunner;
use crate::collaborators::{
    AccountDirectory, ColdStorage, InMemoryAccounts, InMemoryColdStorage, InMemoryMailer,
    InMemoryObjectStore, LocalOrchestrator, ObjectStore, UserProfile, UserRole,
};
use crate::config::CoordinatorConfig;
use crate::coordinator::{Collaborators, Stages};
use crate::record_store::{InMemoryJobStore, JobRecordStore};
use crate::stages::StageProcessor;
use crate::workers::drain_once;

const MAX_ROUNDS: usize = 20;

struct Harness {
    _dir: tempfile::TempDir,
    config: CoordinatorConfig,
    store: Arc<InMemoryJobStore>,
    accounts: Arc<InMemoryAccounts>,
    objects: Arc<InMemoryObjectStore>,
    cold: Arc<InMemoryColdStorage>,
    mailer: Arc<InMemoryMailer>,
    runner: Arc<InstantRunner>,
    orchestrator: Arc<LocalOrchestrator>,
    topics: Arc<InMemoryTopics>,
    stages: Stages,
    queues: Vec<(Arc<InMemoryQueue>, Arc<dyn StageProcessor>)>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn harness(visibility_timeout: Duration) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = CoordinatorConfig::default();
    config.annotator.jobs_dir = dir.path().join("jobs");

    let store = Arc::new(InMemoryJobStore::new());
    let accounts = Arc::new(InMemoryAccounts::new());
    accounts.insert(UserProfile {
        user_id: UserId::new("U1").unwrap(),
        name: "Ada".into(),
        email: "ada@example.org".into(),
        role: UserRole::FreeUser,
    });
    let objects = Arc::new(InMemoryObjectStore::new());
    let topics = Arc::new(InMemoryTopics::new());
    let cold = Arc::new(InMemoryColdStorage::new().with_vault(config.storage.vault.clone()));
    cold.set_notifier(topics.clone());
    let mailer = Arc::new(InMemoryMailer::new());
    let runner = Arc::new(InstantRunner::new(
        &config.annotator.result_suffix,
        &config.annotator.log_suffix,
    ));
    let orchestrator = Arc::new(LocalOrchestrator::new(Duration::ZERO));

    let collaborators = Collaborators {
        store: store.clone(),
        accounts: accounts.clone(),
        objects: objects.clone(),
        cold: cold.clone(),
        mailer: mailer.clone(),
        runner: runner.clone(),
        orchestrator: orchestrator.clone(),
        publisher: topics.clone(),
    };
    let stages = Stages::new(&collaborators, &config);

    let queues = stages
        .processors()
        .into_iter()
        .map(|processor| {
            let queue = Arc::new(InMemoryQueue::with_visibility_timeout(
                processor.name(),
                visibility_timeout,
            ));
            topics.subscribe(processor.topic(), queue.clone());
            (queue, processor)
        })
        .collect();

    Harness {
        _dir: dir,
        config,
        store,
        accounts,
        objects,
        cold,
        mailer,
        runner,
        orchestrator,
        topics,
        stages,
        queues,
    }
}

impl Harness {
    /// Drain every queue until a full round receives nothing.
    fn pump(&self) {
        let options = ReceiveOptions::new(10, Duration::ZERO);
        for _ in 0..MAX_ROUNDS {
            let mut received = 0;
            for (queue, processor) in &self.queues {
                received += drain_once(queue.as_ref(), processor.as_ref(), options).unwrap();
            }
            if received == 0 {
                return;
            }
        }
    }

    fn queued(&self, topic: Topic) -> usize {
        self.queues
            .iter()
            .filter(|(_, p)| p.topic() == topic)
            .map(|(q, _)| q.len())
            .sum()
    }

    fn upload(&self, job: &str) -> JobId {
        let input = ObjectLocation::new(
            self.config.storage.inputs_bucket.as_str(),
            format!("U1/{job}~sample.vcf"),
        )
        .unwrap();
        self.objects.put(&input, b"##fileformat=VCFv4.2").unwrap();
        let event = LifecycleEvent::UploadCompleted(UploadCompleted {
            job_id: JobId::new(job).unwrap(),
            user_id: UserId::new("U1").unwrap(),
            input_file_name: "sample.vcf".into(),
            input_location: input,
        });
        self.topics.publish(Topic::JobUploads, &event).unwrap();
        JobId::new(job).unwrap()
    }

    fn status(&self, job_id: &JobId) -> JobStatus {
        self.store.get(job_id).unwrap().unwrap().status
    }

    fn run_archivals(&self) -> usize {
        self.orchestrator.run_due(|r| self.stages.workflow.run(r))
    }

    fn upgrade(&self) {
        let user_id = UserId::new("U1").unwrap();
        self.accounts.update_role(&user_id, UserRole::PremiumUser).unwrap();
        self.topics
            .publish(
                Topic::JobThaw,
                &LifecycleEvent::UpgradeRequested(UpgradeRequested { user_id }),
            )
            .unwrap();
    }

    /// Upload, run and archive one job for the free user.
    fn archived_job(&self, job: &str) -> JobId {
        let job_id = self.upload(job);
        self.pump();
        self.stages.sweep.run();
        self.pump();
        self.run_archivals();
        assert_eq!(self.status(&job_id), JobStatus::Archived);
        job_id
    }
}

#[test]
fn full_lifecycle_free_user_then_upgrade() {
    let h = harness(Duration::from_secs(30));

    // Submission and execution.
    let job_id = h.upload("J1");
    h.pump();
    assert_eq!(h.status(&job_id), JobStatus::Running);
    assert_eq!(h.runner.launched(), vec![job_id.clone()]);

    // Completion.
    let report = h.stages.sweep.run();
    assert_eq!(report.completed, 1);
    let completed = h.store.get(&job_id).unwrap().unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    let result = completed.result_location.clone().unwrap();
    assert!(h.objects.exists(&result).unwrap());

    h.pump();
    let mail = h.mailer.sent();
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].to, "ada@example.org");
    assert!(mail[0].body.contains("/jobs/J1"));

    // A duplicate completion changes nothing and mails nobody.
    let jobs_dir = &h.config.annotator.jobs_dir;
    std::fs::write(jobs_dir.join("J1~sample.annot.vcf"), b"annotated").unwrap();
    std::fs::write(jobs_dir.join("J1~sample.vcf.count.log"), b"1 line").unwrap();
    assert_eq!(h.stages.sweep.run().completed, 0);
    let again = h.store.get(&job_id).unwrap().unwrap();
    assert_eq!(again, completed);
    h.pump();
    assert_eq!(h.mailer.sent().len(), 1);

    // Archival after the grace period.
    assert_eq!(h.run_archivals(), 1);
    let archived = h.store.get(&job_id).unwrap().unwrap();
    assert_eq!(archived.status, JobStatus::Archived);
    let archive_id = archived.archive_id.clone().unwrap();
    assert!(!h.objects.exists(&result).unwrap());
    assert!(h.cold.archive_exists(&h.config.storage.vault, &archive_id).unwrap());

    // Upgrade starts an expedited retrieval.
    h.upgrade();
    h.pump();
    let thawing = h.store.get(&job_id).unwrap().unwrap();
    assert_eq!(thawing.status, JobStatus::Archived);
    assert_eq!(thawing.retrieval, Some(RetrievalTier::Expedited));

    // Retrieval completes and the results come back.
    let pending = h.cold.pending_retrievals();
    assert_eq!(pending.len(), 1);
    h.cold.complete_retrieval(&pending[0]).unwrap();
    h.pump();

    let restored = h.store.get(&job_id).unwrap().unwrap();
    assert_eq!(restored.status, JobStatus::Completed);
    assert_eq!(restored.archive_id, None);
    assert_eq!(restored.retrieval, None);
    assert_eq!(restored.complete_time, completed.complete_time);
    assert_eq!(h.objects.get(&result).unwrap(), b"annotated");
    assert!(!h.cold.archive_exists(&h.config.storage.vault, &archive_id).unwrap());
}

#[test]
fn duplicate_upload_runs_the_job_once() {
    let h = harness(Duration::from_secs(30));
    let job_id = h.upload("J1");
    h.upload("J1");
    h.pump();

    assert_eq!(h.store.len(), 1);
    assert_eq!(h.status(&job_id), JobStatus::Running);
    assert_eq!(h.runner.launched().len(), 1);
    assert_eq!(h.queued(Topic::JobUploads), 0);
    assert_eq!(h.queued(Topic::JobRequests), 0);
}

#[test]
fn upgrade_cancels_archival_inside_grace_period() {
    let h = harness(Duration::from_secs(30));
    let job_id = h.upload("J1");
    h.pump();
    h.stages.sweep.run();
    h.pump();

    h.upgrade();
    h.pump();
    assert_eq!(h.run_archivals(), 0);
    assert_eq!(h.status(&job_id), JobStatus::Completed);
    assert_eq!(h.cold.archive_count(), 0);
}

#[test]
fn thaw_falls_back_to_standard_when_expedited_is_exhausted() {
    let h = harness(Duration::from_secs(30));
    let job_id = h.archived_job("J1");
    h.cold.exhaust(RetrievalTier::Expedited);

    h.upgrade();
    h.pump();
    let job = h.store.get(&job_id).unwrap().unwrap();
    assert_eq!(job.retrieval, Some(RetrievalTier::Standard));
    assert_eq!(h.queued(Topic::JobThaw), 0);
}

#[test]
fn thaw_is_retried_when_both_tiers_are_exhausted() {
    let h = harness(Duration::ZERO);
    let job_id = h.archived_job("J1");
    h.cold.exhaust(RetrievalTier::Expedited);
    h.cold.exhaust(RetrievalTier::Standard);

    h.upgrade();
    h.pump();
    assert_eq!(h.store.get(&job_id).unwrap().unwrap().retrieval, None);
    assert_eq!(h.queued(Topic::JobThaw), 1);

    h.cold.restore_capacity(RetrievalTier::Expedited);
    h.pump();
    assert_eq!(
        h.store.get(&job_id).unwrap().unwrap().retrieval,
        Some(RetrievalTier::Expedited)
    );
    assert_eq!(h.queued(Topic::JobThaw), 0);
}
