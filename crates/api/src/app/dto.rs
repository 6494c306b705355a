use serde::Deserialize;
use serde_json::{json, Value};

use annoflow_core::{Job, JobId, ObjectLocation, UserId};
use annoflow_events::UploadCompleted;
use annoflow_infra::stages::{parse_upload_key, StageError};

// -------------------------
// Request DTOs
// -------------------------

/// Submission signal.
///
/// Either names the job explicitly (`job_id` + `input_file_name`), names only
/// the file (a fresh job id is minted), or leaves both to be parsed from an
/// upload key of the form `<prefix>/<job_id>~<input_file_name>`.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub user_id: String,
    pub key: String,
    /// Defaults to the configured inputs bucket.
    pub bucket: Option<String>,
    pub job_id: Option<String>,
    pub input_file_name: Option<String>,
}

impl SubmitJobRequest {
    pub fn into_upload(self, default_bucket: &str) -> Result<UploadCompleted, StageError> {
        let user_id = UserId::new(self.user_id)?;
        let bucket = self.bucket.unwrap_or_else(|| default_bucket.to_string());
        let location = ObjectLocation::new(bucket, self.key)?;

        match (self.job_id, self.input_file_name) {
            (Some(job_id), Some(input_file_name)) => Ok(UploadCompleted {
                job_id: JobId::new(job_id)?,
                user_id,
                input_file_name,
                input_location: location,
            }),
            (None, Some(input_file_name)) => Ok(UploadCompleted {
                job_id: JobId::generate(),
                user_id,
                input_file_name,
                input_location: location,
            }),
            (None, None) => parse_upload_key(user_id, location),
            (Some(_), None) => Err(StageError::Validation(
                "job_id requires input_file_name".into(),
            )),
        }
    }
}

// -------------------------
// JSON views
// -------------------------

/// Presigned download links attached to a job view.
#[derive(Debug, Default)]
pub struct JobLinks {
    pub input_url: Option<String>,
    pub result_url: Option<String>,
    pub log_url: Option<String>,
}

pub fn job_to_json(job: &Job) -> Value {
    json!({
        "job_id": job.job_id.as_str(),
        "user_id": job.user_id.as_str(),
        "input_file_name": job.input_file_name,
        "submit_time": job.submit_time,
        "status": job.status.as_str(),
        "complete_time": job.complete_time,
        "archived": job.is_archived(),
        "retrieval": job.retrieval.map(|t| t.as_str()),
    })
}

pub fn job_detail_to_json(job: &Job, links: JobLinks) -> Value {
    let mut view = job_to_json(job);
    if let Value::Object(map) = &mut view {
        map.insert("input_location".into(), json!(job.input_location));
        map.insert("result_location".into(), json!(job.result_location));
        map.insert("log_location".into(), json!(job.log_location));
        map.insert("archive_id".into(), json!(job.archive_id));
        map.insert("version".into(), json!(job.version));
        map.insert("input_url".into(), json!(links.input_url));
        map.insert("result_url".into(), json!(links.result_url));
        map.insert("log_url".into(), json!(links.log_url));
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(job_id: Option<&str>, name: Option<&str>, key: &str) -> SubmitJobRequest {
        SubmitJobRequest {
            user_id: "U1".into(),
            key: key.into(),
            bucket: None,
            job_id: job_id.map(str::to_string),
            input_file_name: name.map(str::to_string),
        }
    }

    #[test]
    fn explicit_fields_are_used_as_given() {
        let upload = request(Some("J1"), Some("a.vcf"), "U1/J1~a.vcf")
            .into_upload("inputs")
            .unwrap();
        assert_eq!(upload.job_id.as_str(), "J1");
        assert_eq!(upload.input_location.bucket, "inputs");
    }

    #[test]
    fn key_is_parsed_when_fields_are_absent() {
        let upload = request(None, None, "uploads/U1/J7~reads.vcf").into_upload("inputs").unwrap();
        assert_eq!(upload.job_id.as_str(), "J7");
        assert_eq!(upload.input_file_name, "reads.vcf");
    }

    #[test]
    fn job_id_is_minted_when_only_the_file_is_named() {
        let upload = request(None, Some("reads.vcf"), "incoming/reads.vcf")
            .into_upload("inputs")
            .unwrap();
        assert_eq!(upload.input_file_name, "reads.vcf");
        assert_eq!(upload.input_location.key, "incoming/reads.vcf");
        assert!(JobId::new(upload.job_id.as_str()).is_ok());
    }

    #[test]
    fn unsafe_job_id_is_rejected() {
        for job_id in ["J~1", "../escaped"] {
            assert!(matches!(
                request(Some(job_id), Some("a.vcf"), "U1/x~a.vcf").into_upload("inputs"),
                Err(StageError::Validation(_))
            ));
        }
    }

    #[test]
    fn half_specified_request_is_rejected() {
        assert!(matches!(
            request(Some("J1"), None, "U1/J1~a.vcf").into_upload("inputs"),
            Err(StageError::Validation(_))
        ));
    }
}
