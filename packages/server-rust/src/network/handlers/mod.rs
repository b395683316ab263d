//! Operational endpoints every listen port carries.
//!
//! `/health` is registered on every port; `/metrics` only where the port
//! is configured to expose it.

pub mod health;
pub mod metrics;

pub use health::health_handler;
pub use metrics::metrics_handler;

/// Path of the liveness endpoint.
pub const HEALTH_PATH: &str = "/health";
/// Path of the Prometheus exposition endpoint.
pub const METRICS_PATH: &str = "/metrics";
