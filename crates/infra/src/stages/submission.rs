//! Submission: create the PENDING record and request execution.

use std::sync::Arc;

use tracing::info;

use annoflow_core::{Job, JobId, JobStatus, ObjectLocation, UserId};
use annoflow_events::{JobRequested, LifecycleEvent, Publisher, Topic, UploadCompleted};

use super::{unexpected, DeliveryContext, StageError, StageProcessor};
use crate::record_store::{JobRecordStore, RecordStoreError};

/// Build an upload signal from an object key of the form
/// `<prefix>/<job_id>~<input_file_name>`.
pub fn parse_upload_key(user_id: UserId, location: ObjectLocation) -> Result<UploadCompleted, StageError> {
    let file_name = location.file_name();
    let (job_id, input_file_name) = file_name.split_once('~').ok_or_else(|| {
        StageError::Validation(format!("key {:?} has no job id separator", location.key))
    })?;
    if input_file_name.trim().is_empty() {
        return Err(StageError::Validation(format!("key {:?} has no file name", location.key)));
    }

    Ok(UploadCompleted {
        job_id: JobId::new(job_id)?,
        user_id,
        input_file_name: input_file_name.to_string(),
        input_location: location.clone(),
    })
}

pub struct SubmissionStage {
    store: Arc<dyn JobRecordStore>,
    publisher: Arc<dyn Publisher>,
}

impl SubmissionStage {
    pub fn new(store: Arc<dyn JobRecordStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    /// Create the record and publish the execution request.
    ///
    /// A second submission of the same `job_id` fails with `DuplicateJob`.
    /// If that record is still PENDING the request is published again, so a
    /// crash between the write and the publish does not strand the job.
    pub fn submit(&self, upload: UploadCompleted) -> Result<Job, StageError> {
        LifecycleEvent::UploadCompleted(upload.clone()).validate()?;

        let job = Job::submitted(
            upload.job_id,
            upload.user_id,
            upload.input_file_name,
            upload.input_location,
            chrono::Utc::now().timestamp(),
        )?;

        match self.store.put(&job) {
            Ok(()) => {
                info!(job_id = %job.job_id, user_id = %job.user_id, "job submitted");
                self.request_execution(&job)?;
                Ok(job)
            }
            Err(RecordStoreError::AlreadyExists(job_id)) => {
                if let Some(existing) = self.store.get(&job_id)? {
                    if existing.status == JobStatus::Pending && existing.user_id == job.user_id {
                        self.request_execution(&existing)?;
                    }
                }
                Err(StageError::DuplicateJob(job_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn request_execution(&self, job: &Job) -> Result<(), StageError> {
        let event = LifecycleEvent::JobRequested(JobRequested {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            input_file_name: job.input_file_name.clone(),
            input_location: job.input_location.clone(),
            submit_time: job.submit_time,
        });
        self.publisher.publish(Topic::JobRequests, &event)?;
        Ok(())
    }
}

impl StageProcessor for SubmissionStage {
    fn name(&self) -> &'static str {
        "submission"
    }

    fn topic(&self) -> Topic {
        Topic::JobUploads
    }

    fn process(&self, event: LifecycleEvent, _ctx: DeliveryContext<'_>) -> Result<(), StageError> {
        match event {
            LifecycleEvent::UploadCompleted(upload) => self.submit(upload).map(|_| ()),
            other => Err(unexpected(self.name(), &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annoflow_events::{decode, InMemoryTopics};
    use crate::record_store::InMemoryJobStore;

    fn upload(job: &str) -> UploadCompleted {
        UploadCompleted {
            job_id: JobId::new(job).unwrap(),
            user_id: UserId::new("U1").unwrap(),
            input_file_name: "sample.vcf".into(),
            input_location: ObjectLocation::new("inputs", format!("u/U1/{job}~sample.vcf")).unwrap(),
        }
    }

    fn stage() -> (SubmissionStage, Arc<InMemoryJobStore>, Arc<InMemoryTopics>) {
        let store = Arc::new(InMemoryJobStore::new());
        let topics = Arc::new(InMemoryTopics::new());
        (SubmissionStage::new(store.clone(), topics.clone()), store, topics)
    }

    #[test]
    fn creates_pending_record_and_requests_execution() {
        let (stage, store, topics) = stage();
        let job = stage.submit(upload("J1")).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(store.get(&job.job_id).unwrap(), Some(job.clone()));

        let published = topics.published(Topic::JobRequests);
        assert_eq!(published.len(), 1);
        let body = annoflow_events::Envelope::new(Topic::JobRequests, published[0].clone())
            .to_body()
            .unwrap();
        match decode(Topic::JobRequests, &body).unwrap() {
            LifecycleEvent::JobRequested(r) => {
                assert_eq!(r.job_id, job.job_id);
                assert_eq!(r.submit_time, job.submit_time);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_submission_is_reported_and_republished_while_pending() {
        let (stage, store, topics) = stage();
        stage.submit(upload("J1")).unwrap();
        let err = stage.submit(upload("J1")).unwrap_err();

        assert!(matches!(err, StageError::DuplicateJob(_)));
        assert_eq!(store.len(), 1);
        assert_eq!(topics.published(Topic::JobRequests).len(), 2);
    }

    #[test]
    fn blank_file_name_is_a_validation_error() {
        let (stage, store, _) = stage();
        let mut bad = upload("J1");
        bad.input_file_name = "".into();
        assert!(matches!(stage.submit(bad), Err(StageError::Validation(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn upload_key_is_parsed() {
        let loc = ObjectLocation::new("inputs", "prefix/U1/abc-123~my sample.vcf").unwrap();
        let upload = parse_upload_key(UserId::new("U1").unwrap(), loc).unwrap();
        assert_eq!(upload.job_id.as_str(), "abc-123");
        assert_eq!(upload.input_file_name, "my sample.vcf");
    }

    #[test]
    fn upload_key_without_separator_is_rejected() {
        let loc = ObjectLocation::new("inputs", "prefix/U1/sample.vcf").unwrap();
        assert!(parse_upload_key(UserId::new("U1").unwrap(), loc).is_err());
        let loc = ObjectLocation::new("inputs", "prefix/U1/~sample.vcf").unwrap();
        assert!(parse_upload_key(UserId::new("U1").unwrap(), loc).is_err());
    }
}
