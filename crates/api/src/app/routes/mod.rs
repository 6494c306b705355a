use axum::Router;

pub mod jobs;
pub mod system;
pub mod users;

/// Router for the job and account endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/users", users::router())
}
