//! Unary call processing.
//!
//! 1. **Procedures** (`procedure`): typed handlers grouped into services
//! 2. **Interceptors** (`middleware`): Tower layers every call runs through
//! 3. **Reporting** (`report`): the external error-reporting sink
//! 4. **Hub** (`hub`): the unary JSON transport that mounts services on a port

pub mod call;
pub mod hub;
pub mod middleware;
pub mod procedure;
pub mod report;

pub use call::{Call, CallError, Diagnostics, Reply, Role};
pub use hub::{status_response, ConnectHub};
pub use middleware::{build_interceptor_chain, InterceptorConfig, CALL_DEADLINE_CEILING};
pub use procedure::{BoxCallService, RpcService};
pub use report::{ErrorReport, ErrorReporter, NoopReporter};
#[cfg(feature = "sentry")]
pub use report::SentryReporter;
