//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend selection and the shared handler state
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and JSON views
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_backend, in_memory_backend, AppServices, Backend};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
