use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use annoflow_core::DomainError;
use annoflow_events::PublishError;
use annoflow_infra::collaborators::ProviderError;
use annoflow_infra::record_store::RecordStoreError;
use annoflow_infra::stages::StageError;

pub fn stage_error_to_response(err: StageError) -> axum::response::Response {
    match err {
        StageError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        StageError::InvalidEvent(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_event", msg),
        StageError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StageError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StageError::DuplicateJob(job_id) => json_error(
            StatusCode::CONFLICT,
            "duplicate_job",
            format!("job {job_id} already exists"),
        ),
        StageError::Transient(msg) | StageError::Capacity(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
        }
        StageError::FatalConfig(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "misconfigured", msg)
        }
    }
}

pub fn store_error_to_response(err: RecordStoreError) -> axum::response::Response {
    match err {
        RecordStoreError::NotFound(job_id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found"))
        }
        RecordStoreError::AlreadyExists(job_id) => json_error(
            StatusCode::CONFLICT,
            "duplicate_job",
            format!("job {job_id} already exists"),
        ),
        RecordStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        RecordStoreError::Invariant(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        RecordStoreError::Storage(msg) | RecordStoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
    }
}

pub fn provider_error_to_response(err: ProviderError) -> axum::response::Response {
    match err {
        ProviderError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        ProviderError::Capacity(msg) | ProviderError::Transient(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
        }
        ProviderError::MissingResource(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "misconfigured", msg)
        }
        ProviderError::Rejected(msg) => json_error(StatusCode::BAD_REQUEST, "rejected", msg),
    }
}

pub fn publish_error_to_response(err: PublishError) -> axum::response::Response {
    json_error(StatusCode::BAD_GATEWAY, "publish_error", err.to_string())
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
