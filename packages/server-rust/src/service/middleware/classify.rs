//! Outermost layer: turns whatever the inner stack produced into a
//! wire-visible status, logs it once and decides whether to report it.
//!
//! Ordering for a failed call:
//! 1. Panics (while building or while polling the inner future) become
//!    unclassified errors; the process keeps running.
//! 2. One log entry with the original code, message and procedure.
//! 3. Reportable codes go to the [`ErrorReporter`] unless the peer already
//!    disconnected.
//! 4. The visible status: wire errors and unclassified errors collapse to
//!    `internal`; any other explicit status passes through.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::FutureExt;
use portico_core::{CallContext, Code, ContextError, RpcError};
use tower::{Layer, Service};
use tracing::{error, info};

use crate::service::call::{Call, CallError, CallFuture, Diagnostics, Reply};
use crate::service::report::{report_headers, ErrorReport, ErrorReporter, NoopReporter};

// ---------------------------------------------------------------------------
// ClassifyLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ClassifyLayer {
    reporter: Arc<dyn ErrorReporter>,
    verbose: bool,
}

impl ClassifyLayer {
    /// `verbose` puts the full error chain into `internal` messages; meant
    /// for local development only.
    #[must_use]
    pub fn new(reporter: Arc<dyn ErrorReporter>, verbose: bool) -> Self {
        Self { reporter, verbose }
    }
}

impl Default for ClassifyLayer {
    fn default() -> Self {
        Self::new(Arc::new(NoopReporter), false)
    }
}

impl std::fmt::Debug for ClassifyLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifyLayer")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for ClassifyLayer {
    type Service = ClassifyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClassifyService {
            inner,
            reporter: Arc::clone(&self.reporter),
            verbose: self.verbose,
        }
    }
}

// ---------------------------------------------------------------------------
// ClassifyService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ClassifyService<S> {
    inner: S,
    reporter: Arc<dyn ErrorReporter>,
    verbose: bool,
}

/// What the classifier keeps from the call once it moved inward.
struct CallInfo {
    id: uuid::Uuid,
    procedure: String,
    http_method: String,
    headers: axum::http::HeaderMap,
    peer: Option<String>,
    ctx: CallContext,
    diagnostics: Diagnostics,
}

impl CallInfo {
    fn from_call(call: &Call) -> Self {
        Self {
            id: call.id,
            procedure: call.procedure.clone(),
            http_method: call.http_method.to_string(),
            headers: call.headers.clone(),
            peer: call.peer.clone(),
            ctx: call.ctx.clone(),
            diagnostics: call.diagnostics().clone(),
        }
    }

    fn host(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
    }

    /// The caller went away before the call finished.
    fn disconnected(&self) -> bool {
        self.ctx.err() == Some(ContextError::Canceled)
    }
}

impl<S> Service<Call> for ClassifyService<S>
where
    S: Service<Call, Response = Reply, Error = CallError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = CallError;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: Call) -> Self::Future {
        let info = CallInfo::from_call(&call);
        let started = Instant::now();

        let inner = &mut self.inner;
        let fut: CallFuture = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(call))) {
            Ok(fut) => Box::pin(fut),
            Err(payload) => {
                let err = panic_error(payload.as_ref());
                Box::pin(async move { Err(CallError::Status(err)) })
            }
        };

        let reporter = Arc::clone(&self.reporter);
        let verbose = self.verbose;

        Box::pin(async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(CallError::Status(panic_error(payload.as_ref()))),
            };

            let result = match result {
                Err(CallError::Status(err)) if !err.is_classified() => {
                    Err(CallError::Status(classify(err, &info, reporter.as_ref(), verbose)))
                }
                other => other,
            };

            record_metrics(&info.procedure, &result, started);
            result
        })
    }
}

/// Logs and maybe reports one failure, then produces the visible status.
fn classify(err: RpcError, info: &CallInfo, reporter: &dyn ErrorReporter, verbose: bool) -> RpcError {
    let disconnected = info.disconnected();
    let code = err.code().as_str();
    let detail = err.detail();

    if disconnected {
        info!(
            code,
            status_message = err.message(),
            procedure = %info.procedure,
            call_id = %info.id,
            detail = %detail,
            "Call failed after the peer disconnected"
        );
    } else {
        error!(
            code,
            status_message = err.message(),
            procedure = %info.procedure,
            call_id = %info.id,
            detail = %detail,
            "Call failed"
        );
    }

    if !disconnected && err.code().is_reportable() {
        let headers = report_headers(&info.headers);
        reporter.report(&ErrorReport {
            call_id: info.id,
            procedure: &info.procedure,
            error: &err,
            request: info.diagnostics.get(),
            headers,
            peer: info.peer.as_deref(),
            host: info.host(),
            http_method: &info.http_method,
        });
    }

    visible_status(err, verbose).__into_classified()
}

fn visible_status(err: RpcError, verbose: bool) -> RpcError {
    if !err.is_wire() && err.code() != Code::Unknown {
        return err;
    }
    if verbose {
        RpcError::new(Code::Internal, err.detail()).with_cause(err)
    } else {
        RpcError::internal().with_cause(err)
    }
}

pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> RpcError {
    RpcError::from(anyhow::anyhow!("panic: {}", panic_message(payload)))
}

/// Text of a panic payload, for `&str` and `String` payloads.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn record_metrics(procedure: &str, result: &Result<Reply, CallError>, started: Instant) {
    let code = match result {
        Ok(_) => "ok",
        Err(CallError::Status(err)) => err.code().as_str(),
        Err(CallError::Fatal(_)) => "fatal",
    };
    metrics::counter!(
        "portico_rpc_calls_total",
        "procedure" => procedure.to_string(),
        "code" => code,
    )
    .increment(1);
    metrics::histogram!(
        "portico_rpc_call_duration_seconds",
        "procedure" => procedure.to_string(),
    )
    .record(started.elapsed().as_secs_f64());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
