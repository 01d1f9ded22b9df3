//! service-core: shared infrastructure for the LTI tool provider services.
pub mod config;
pub mod error;
pub mod observability;

pub use axum;
pub use serde;
pub use serde_json;
pub use tracing;
