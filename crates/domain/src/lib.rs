//! Domain-level building blocks shared across the API and monitor crates:
//! validated mint identifiers, the in-memory holder-count store, runtime
//! configuration and telemetry bootstrap.

pub mod config;
pub mod model;
pub mod services;

pub use model::*;
pub use services::*;
