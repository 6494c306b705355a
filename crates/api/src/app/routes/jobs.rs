use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use annoflow_core::{Job, JobId};
use annoflow_infra::collaborators::{ObjectStore, ProviderError};
use annoflow_infra::record_store::JobRecordStore;
use annoflow_infra::stages::StageError;

use crate::app::dto::{self, JobLinks};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:job_id", get(get_job))
}

/// Submission signal. A repeated signal for the same job answers 200 with the
/// existing record instead of creating a second one.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let upload = match body.into_upload(&services.inputs_bucket) {
        Ok(u) => u,
        Err(e) => return errors::stage_error_to_response(e),
    };
    let user_id = upload.user_id.clone();

    let outcome = services
        .blocking(move |s| match s.submission.submit(upload) {
            Ok(job) => Ok((job, false)),
            Err(StageError::DuplicateJob(job_id)) => match s.store.get(&job_id) {
                Ok(Some(existing)) if existing.user_id == user_id => Ok((existing, true)),
                Ok(_) => Err(StageError::DuplicateJob(job_id)),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        })
        .await;

    match outcome {
        Ok(Ok((job, false))) => {
            (StatusCode::CREATED, Json(serde_json::json!({ "job": dto::job_to_json(&job) })))
                .into_response()
        }
        Ok(Ok((job, true))) => {
            info!(job_id = %job.job_id, "duplicate submission signal");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "job": dto::job_to_json(&job), "duplicate": true })),
            )
                .into_response()
        }
        Ok(Err(e)) => errors::stage_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match JobId::new(job_id) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let outcome = services
        .blocking(move |s| -> Result<Option<serde_json::Value>, axum::response::Response> {
            let Some(job) = s.store.get(&job_id).map_err(errors::store_error_to_response)? else {
                return Ok(None);
            };
            let links = presign_links(s, &job).map_err(errors::provider_error_to_response)?;
            Ok(Some(dto::job_detail_to_json(&job, links)))
        })
        .await;

    match outcome {
        Ok(Ok(Some(view))) => (StatusCode::OK, Json(view)).into_response(),
        Ok(Ok(None)) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Ok(Err(resp)) | Err(resp) => resp,
    }
}

/// Input is always downloadable; result and log only while they sit in hot
/// storage.
fn presign_links(
    services: &AppServices,
    job: &Job,
) -> Result<JobLinks, ProviderError> {
    let ttl = services.presigned_ttl;
    let mut links = JobLinks {
        input_url: Some(services.objects.presigned_url(&job.input_location, ttl)?),
        ..JobLinks::default()
    };
    if !job.is_archived() {
        if let Some(result) = &job.result_location {
            links.result_url = Some(services.objects.presigned_url(result, ttl)?);
        }
        if let Some(log) = &job.log_location {
            links.log_url = Some(services.objects.presigned_url(log, ttl)?);
        }
    }
    Ok(links)
}
