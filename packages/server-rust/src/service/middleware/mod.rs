//! Tower middleware layers for the call pipeline.
//!
//! - [`classify`]: Panic recovery, status classification, logging and reporting
//! - [`role_guard`]: Fatal rejection of client-role calls
//! - [`deadline`]: Per-call deadline ceiling
//! - [`redact`]: Sanitized request copy for diagnostics
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod classify;
pub mod deadline;
pub mod pipeline;
pub mod redact;
pub mod role_guard;

pub use classify::ClassifyLayer;
pub use deadline::{DeadlineLayer, CALL_DEADLINE_CEILING};
pub use pipeline::{build_interceptor_chain, InterceptorConfig};
pub use redact::RedactLayer;
pub use role_guard::RoleGuardLayer;
