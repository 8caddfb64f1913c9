//! HTTP application wiring (axum router + service wiring).
//!
//! - `services.rs`: infrastructure wiring (store/ledger/cache/queue, the
//!   in-memory vs persistent switch)
//! - `routes.rs`: HTTP routes + handlers
//! - `dto.rs`: response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Extension;
use axum::Router;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// The framework body limit is disabled because ingestion enforces its own
/// maximum incrementally, surfacing the domain `PayloadTooLarge` error.
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    routes::router()
        .layer(Extension(services))
        .layer(DefaultBodyLimit::disable())
}
