//! Process-wide observability wiring.

mod tracing;

pub use tracing::init;
