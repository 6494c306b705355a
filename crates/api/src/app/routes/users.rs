use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use annoflow_core::UserId;
use annoflow_events::{LifecycleEvent, Publisher, Topic, UpgradeRequested};
use annoflow_infra::collaborators::{AccountDirectory, UserRole};
use annoflow_infra::record_store::JobRecordStore;

use crate::app::{dto, errors};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/:user_id/jobs", get(list_jobs))
        .route("/:user_id/upgrade", post(upgrade))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    let user_id = match UserId::new(user_id) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.blocking(move |s| s.store.query_by_user(&user_id)).await {
        Ok(Ok(jobs)) => {
            let items: Vec<_> = jobs.iter().map(dto::job_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

/// Move the user to the premium tier and ask for their archived results to
/// be thawed.
pub async fn upgrade(
    Extension(services): Extension<Arc<AppServices>>,
    Path(user_id): Path<String>,
) -> axum::response::Response {
    let user_id = match UserId::new(user_id) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    let outcome = services
        .blocking(move |s| -> Result<UserId, axum::response::Response> {
            s.accounts
                .update_role(&user_id, UserRole::PremiumUser)
                .map_err(errors::provider_error_to_response)?;
            let event = LifecycleEvent::UpgradeRequested(UpgradeRequested {
                user_id: user_id.clone(),
            });
            s.publisher
                .publish(Topic::JobThaw, &event)
                .map_err(errors::publish_error_to_response)?;
            Ok(user_id)
        })
        .await;

    match outcome {
        Ok(Ok(user_id)) => {
            info!(user_id = %user_id, "user upgraded");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "user_id": user_id.as_str(),
                    "role": UserRole::PremiumUser.as_str(),
                })),
            )
                .into_response()
        }
        Ok(Err(resp)) | Err(resp) => resp,
    }
}
