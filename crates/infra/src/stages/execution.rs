//! Execution: fetch the input, hand it to the annotation tool, and later
//! collect the tool's output.
//!
//! The request message is deleted as soon as the tool is launched and the
//! record is RUNNING; nothing holds the message open while the tool runs.
//! Completion is detected separately by [`CompletionSweep`], which scans the
//! local jobs directory for finished output.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use annoflow_core::{
    CompletionPayload, ExpectedState, JobId, JobStatus, ObjectLocation, Transition, UserId,
};
use annoflow_events::{
    ArchiveCandidate, JobRequested, LifecycleEvent, Publisher, ResultsReady, Topic,
};

use super::{
    apply_guarded, apply_transition, unexpected, DeliveryContext, StageError, StageProcessor,
};
use crate::collaborators::{AnnotationRunner, ExitOutcome, LaunchOutcome, ObjectStore};
use crate::config::{AnnotatorConfig, PollConfig, StorageConfig};
use crate::record_store::JobRecordStore;

/// Separator between job id and file name in local and stored file names.
const JOB_FILE_SEPARATOR: char = '~';

fn io_transient(what: &str, path: &Path, err: std::io::Error) -> StageError {
    StageError::Transient(format!("{what} {}: {err}", path.display()))
}

pub struct ExecutionStage {
    store: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    runner: Arc<dyn AnnotationRunner>,
    jobs_dir: PathBuf,
    visibility_extension: Duration,
}

impl ExecutionStage {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        runner: Arc<dyn AnnotationRunner>,
        annotator: &AnnotatorConfig,
        poll: &PollConfig,
    ) -> Self {
        Self {
            store,
            objects,
            runner,
            jobs_dir: annotator.jobs_dir.clone(),
            visibility_extension: poll.visibility_timeout,
        }
    }

    fn execute(&self, request: JobRequested, ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        let job = self
            .store
            .get(&request.job_id)?
            .ok_or_else(|| StageError::NotFound(format!("job {}", request.job_id)))?;

        if job.status != JobStatus::Pending {
            debug!(job_id = %job.job_id, status = %job.status, "execution already started");
            return Ok(());
        }
        if job.input_file_name.contains(['/', '\\']) || job.input_file_name.starts_with('.') {
            return Err(StageError::Validation(format!(
                "unsafe input file name {:?}",
                job.input_file_name
            )));
        }

        if !self.objects.exists(&job.input_location)? {
            return Err(StageError::NotFound(format!("input {}", job.input_location)));
        }

        // Large inputs can take a while to download.
        ctx.extend_visibility(self.visibility_extension);
        let bytes = self.objects.get(&job.input_location)?;

        std::fs::create_dir_all(&self.jobs_dir)
            .map_err(|e| io_transient("create", &self.jobs_dir, e))?;
        let local = self
            .jobs_dir
            .join(format!("{}{JOB_FILE_SEPARATOR}{}", job.job_id, job.input_file_name));
        std::fs::write(&local, &bytes).map_err(|e| io_transient("write", &local, e))?;

        match self.runner.launch(&job.job_id, &local)? {
            LaunchOutcome::Launched => info!(job_id = %job.job_id, "annotation started"),
            LaunchOutcome::AlreadyRunning => debug!(job_id = %job.job_id, "annotation already running"),
        }

        apply_transition(self.store.as_ref(), &job.job_id, &Transition::StartExecution)?;
        Ok(())
    }
}

impl StageProcessor for ExecutionStage {
    fn name(&self) -> &'static str {
        "execution"
    }

    fn topic(&self) -> Topic {
        Topic::JobRequests
    }

    fn process(&self, event: LifecycleEvent, ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        match event {
            LifecycleEvent::JobRequested(request) => self.execute(request, ctx),
            other => Err(unexpected(self.name(), &other)),
        }
    }
}

/// Outcome of one pass over the jobs directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub completed: usize,
    pub failed: usize,
    /// Jobs with files present but output not (yet) complete.
    pub pending: usize,
}

/// Uploads finished output and applies the COMPLETED transition.
///
/// Upload and record update are not transactional. A pass interrupted before
/// the COMPLETED write is finished by the next pass, since local files are
/// only removed once both events were published. Once the record is
/// COMPLETED a later pass only cleans up the leftover files.
pub struct CompletionSweep {
    store: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    runner: Arc<dyn AnnotationRunner>,
    publisher: Arc<dyn Publisher>,
    jobs_dir: PathBuf,
    results_bucket: String,
    results_prefix: String,
    result_suffix: String,
    log_suffix: String,
}

impl CompletionSweep {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        runner: Arc<dyn AnnotationRunner>,
        publisher: Arc<dyn Publisher>,
        annotator: &AnnotatorConfig,
        storage: &StorageConfig,
    ) -> Self {
        Self {
            store,
            objects,
            runner,
            publisher,
            jobs_dir: annotator.jobs_dir.clone(),
            results_bucket: storage.results_bucket.clone(),
            results_prefix: storage.results_prefix.clone(),
            result_suffix: annotator.result_suffix.clone(),
            log_suffix: annotator.log_suffix.clone(),
        }
    }

    pub fn run(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let mut crashed = BTreeSet::new();
        for (job_id, outcome) in self.runner.reap() {
            match outcome {
                ExitOutcome::Succeeded => debug!(job_id = %job_id, "annotator exited"),
                ExitOutcome::Failed(status) => {
                    warn!(job_id = %job_id, %status, "annotator exited with failure");
                    crashed.insert(job_id);
                }
            }
        }

        let groups = match self.job_files() {
            Ok(groups) => groups,
            Err(e) => {
                warn!(dir = %self.jobs_dir.display(), error = %e, "cannot list jobs directory");
                return report;
            }
        };

        for (job_id, files) in groups {
            if crashed.contains(&job_id) {
                // Partial output of a failed run is never uploaded; the job
                // stays RUNNING for an operator to resubmit.
                report.failed += 1;
                remove_files(&job_id, &files);
                continue;
            }
            if self.runner.is_running(&job_id) {
                report.pending += 1;
                continue;
            }

            let result = files.iter().find(|p| has_suffix(p, &self.result_suffix));
            let log = files.iter().find(|p| has_suffix(p, &self.log_suffix));
            let (Some(result), Some(log)) = (result, log) else {
                report.pending += 1;
                continue;
            };

            match self.complete(&job_id, result, log) {
                Ok(newly_completed) => {
                    if newly_completed {
                        report.completed += 1;
                    }
                    remove_files(&job_id, &files);
                }
                Err(e) => {
                    report.failed += 1;
                    e.log("completion_sweep", job_id.as_str());
                }
            }
        }

        report
    }

    /// Local files grouped by the job id prefix of their name.
    fn job_files(&self) -> std::io::Result<BTreeMap<JobId, Vec<PathBuf>>> {
        let mut groups: BTreeMap<JobId, Vec<PathBuf>> = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.jobs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((prefix, _)) = name.split_once(JOB_FILE_SEPARATOR) else {
                continue;
            };
            if let Ok(job_id) = JobId::new(prefix) {
                groups.entry(job_id).or_default().push(path);
            }
        }
        Ok(groups)
    }

    /// Returns `false` when the completion was already recorded; nothing is
    /// uploaded or announced a second time.
    fn complete(&self, job_id: &JobId, result: &Path, log: &Path) -> Result<bool, StageError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| StageError::NotFound(format!("job {job_id}")))?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            debug!(job_id = %job_id, status = %job.status, "completion already recorded");
            return Ok(false);
        }

        let result_location = self.upload(&job.user_id, result)?;
        let log_location = self.upload(&job.user_id, log)?;

        let transition = Transition::CompleteExecution(CompletionPayload {
            complete_time: chrono::Utc::now().timestamp(),
            result_location,
            log_location,
        });
        // Only the write that moves the job into COMPLETED announces it.
        let first_write = ExpectedState::status_in([JobStatus::Pending, JobStatus::Running]);
        let Some(job) = apply_guarded(self.store.as_ref(), job_id, &first_write, &transition)? else {
            return Ok(false);
        };

        let completion = job.completion().ok_or_else(|| {
            StageError::Validation(format!("job {job_id} completed without completion payload"))
        })?;

        self.publisher.publish(
            Topic::JobResults,
            &LifecycleEvent::ResultsReady(ResultsReady {
                job_id: job.job_id.clone(),
                user_id: job.user_id.clone(),
                complete_time: completion.complete_time,
            }),
        )?;
        self.publisher.publish(
            Topic::JobArchive,
            &LifecycleEvent::ArchiveCandidate(ArchiveCandidate {
                job_id: job.job_id.clone(),
                user_id: job.user_id.clone(),
                result_location: completion.result_location,
            }),
        )?;

        info!(job_id = %job.job_id, complete_time = completion.complete_time, "job completed");
        Ok(true)
    }

    fn upload(&self, user_id: &UserId, path: &Path) -> Result<ObjectLocation, StageError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StageError::Validation(format!("bad file name {}", path.display())))?;
        let key = if self.results_prefix.is_empty() {
            format!("{user_id}/{name}")
        } else {
            format!("{}/{user_id}/{name}", self.results_prefix)
        };
        let location = ObjectLocation::new(self.results_bucket.as_str(), key)?;

        let bytes = std::fs::read(path).map_err(|e| io_transient("read", path, e))?;
        self.objects.put(&location, &bytes)?;
        Ok(location)
    }
}

fn remove_files(job_id: &JobId, files: &[PathBuf]) {
    for path in files {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(job_id = %job_id, path = %path.display(), error = %e, "failed to remove local file");
        }
    }
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use annoflow_core::Job;
    use annoflow_events::InMemoryTopics;

    use crate::collaborators::annotator::testing::InstantRunner;
    use crate::collaborators::InMemoryObjectStore;
    use crate::record_store::InMemoryJobStore;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryJobStore>,
        objects: Arc<InMemoryObjectStore>,
        runner: Arc<InstantRunner>,
        topics: Arc<InMemoryTopics>,
        stage: ExecutionStage,
        sweep: CompletionSweep,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let annotator = AnnotatorConfig {
            jobs_dir: dir.path().join("jobs"),
            ..AnnotatorConfig::default()
        };
        let storage = StorageConfig::default();
        let store = Arc::new(InMemoryJobStore::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let runner = Arc::new(InstantRunner::new(&annotator.result_suffix, &annotator.log_suffix));
        let topics = Arc::new(InMemoryTopics::new());

        let stage = ExecutionStage::new(
            store.clone(),
            objects.clone(),
            runner.clone(),
            &annotator,
            &PollConfig::default(),
        );
        let sweep = CompletionSweep::new(
            store.clone(),
            objects.clone(),
            runner.clone(),
            topics.clone(),
            &annotator,
            &storage,
        );
        Fixture { _dir: dir, store, objects, runner, topics, stage, sweep }
    }

    fn seed(f: &Fixture, job: &str) -> Job {
        let input = ObjectLocation::new("inputs", format!("u/U1/{job}~sample.vcf")).unwrap();
        f.objects.put(&input, b"##fileformat=VCF").unwrap();
        let job = Job::submitted(
            JobId::new(job).unwrap(),
            UserId::new("U1").unwrap(),
            "sample.vcf",
            input,
            1,
        )
        .unwrap();
        f.store.put(&job).unwrap();
        job
    }

    fn request(job: &Job) -> LifecycleEvent {
        LifecycleEvent::JobRequested(JobRequested {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            input_file_name: job.input_file_name.clone(),
            input_location: job.input_location.clone(),
            submit_time: job.submit_time,
        })
    }

    #[test]
    fn request_launches_tool_and_marks_running() {
        let f = fixture();
        let job = seed(&f, "J1");
        f.stage.process(request(&job), DeliveryContext::detached()).unwrap();

        assert_eq!(f.store.get(&job.job_id).unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(f.runner.launched(), vec![job.job_id.clone()]);
    }

    #[test]
    fn duplicate_request_does_not_relaunch() {
        let f = fixture();
        let job = seed(&f, "J1");
        f.stage.process(request(&job), DeliveryContext::detached()).unwrap();
        f.stage.process(request(&job), DeliveryContext::detached()).unwrap();
        assert_eq!(f.runner.launched().len(), 1);
    }

    #[test]
    fn missing_input_is_not_found() {
        let f = fixture();
        let job = seed(&f, "J1");
        f.objects.delete(&job.input_location).unwrap();
        let err = f.stage.process(request(&job), DeliveryContext::detached()).unwrap_err();
        assert!(matches!(err, StageError::NotFound(_)));
        assert_eq!(f.store.get(&job.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn sweep_uploads_completes_and_publishes() {
        let f = fixture();
        let job = seed(&f, "J1");
        f.stage.process(request(&job), DeliveryContext::detached()).unwrap();

        let report = f.sweep.run();
        assert_eq!(report, SweepReport { completed: 1, failed: 0, pending: 0 });

        let stored = f.store.get(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let result = stored.result_location.clone().unwrap();
        assert_eq!(result.key, "results/U1/J1~sample.annot.vcf");
        assert_eq!(stored.log_location.clone().unwrap().key, "results/U1/J1~sample.vcf.count.log");
        assert_eq!(f.objects.get(&result).unwrap(), b"annotated");

        assert_eq!(f.topics.published(Topic::JobResults).len(), 1);
        assert_eq!(f.topics.published(Topic::JobArchive).len(), 1);

        // Local files are gone, so a second pass finds nothing.
        assert_eq!(f.sweep.run(), SweepReport::default());
    }

    #[test]
    fn sweep_without_output_leaves_job_pending() {
        let f = fixture();
        std::fs::create_dir_all(&f.sweep.jobs_dir).unwrap();
        std::fs::write(f.sweep.jobs_dir.join("J9~sample.vcf"), b"x").unwrap();
        assert_eq!(f.sweep.run().pending, 1);
    }

    #[test]
    fn request_with_unsafe_job_id_is_dropped_before_touching_disk() {
        use annoflow_events::{DeliveryQueue, Envelope, InMemoryQueue, ReceiveOptions};

        use crate::stages::Disposition;
        use crate::workers::process_delivery;

        let f = fixture();
        let queue = InMemoryQueue::new("requests");
        for job_id in ["J~1", "../escaped"] {
            let message = format!(
                r#"{{"job_id":"{job_id}","user_id":"U1","input_file_name":"sample.vcf","input_location":{{"bucket":"inputs","key":"u/U1/x~sample.vcf"}},"submit_time":1}}"#
            );
            queue
                .send(Envelope::new(Topic::JobRequests, message).to_body().unwrap())
                .unwrap();
        }

        let batch = queue.receive(ReceiveOptions::new(10, Duration::ZERO)).unwrap();
        assert_eq!(batch.len(), 2);
        for delivery in &batch {
            assert_eq!(process_delivery(&queue, &f.stage, delivery), Disposition::Delete);
        }

        assert!(queue.is_empty());
        assert!(f.runner.launched().is_empty());
        assert!(!f.sweep.jobs_dir.exists());
        assert!(!f._dir.path().join("escaped~sample.vcf").exists());
    }

    #[test]
    fn duplicate_completion_is_not_announced_again() {
        let f = fixture();
        let job = seed(&f, "J1");
        f.stage.process(request(&job), DeliveryContext::detached()).unwrap();
        assert_eq!(f.sweep.run().completed, 1);
        let first = f.store.get(&job.job_id).unwrap().unwrap();

        // The tool leaves its output behind a second time.
        let jobs_dir = &f.sweep.jobs_dir;
        std::fs::write(jobs_dir.join("J1~sample.annot.vcf"), b"annotated again").unwrap();
        std::fs::write(jobs_dir.join("J1~sample.vcf.count.log"), b"1 line").unwrap();

        assert_eq!(f.sweep.run(), SweepReport::default());
        let second = f.store.get(&job.job_id).unwrap().unwrap();
        assert_eq!(second.version, first.version);
        assert_eq!(f.objects.get(&first.result_location.unwrap()).unwrap(), b"annotated");
        assert_eq!(f.topics.published(Topic::JobResults).len(), 1);
        assert_eq!(f.topics.published(Topic::JobArchive).len(), 1);
        assert!(!jobs_dir.join("J1~sample.annot.vcf").exists());
    }

    #[test]
    fn failed_run_is_cleaned_up_and_not_completed() {
        let f = fixture();
        let job = seed(&f, "J1");
        f.stage.process(request(&job), DeliveryContext::detached()).unwrap();
        f.runner.exit(&job.job_id, ExitOutcome::Failed("exit status: 1".into()));

        assert_eq!(f.sweep.run(), SweepReport { completed: 0, failed: 1, pending: 0 });
        assert_eq!(f.store.get(&job.job_id).unwrap().unwrap().status, JobStatus::Running);
        assert!(f.topics.published(Topic::JobResults).is_empty());

        // Nothing is left to revisit.
        assert_eq!(f.sweep.run(), SweepReport::default());
    }
}
