//! Deadline middleware for calls.
//!
//! Bounds every call by a fixed ceiling no matter what the caller asked
//! for. The edge load balancer gives up at 30 seconds, so calls resolve
//! with a real status shortly before that.

use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use portico_core::{CallContext, Code, ContextError, RpcError};
use tower::{Layer, Service};

use crate::service::call::{Call, CallError, CallFuture, Reply};

/// Upper bound on any call's lifetime.
pub const CALL_DEADLINE_CEILING: Duration = Duration::from_secs(29);

// ---------------------------------------------------------------------------
// DeadlineLayer
// ---------------------------------------------------------------------------

/// Tower layer replacing each call's context with a child bounded by the
/// ceiling.
///
/// The child keeps any earlier caller deadline. Its guard lives as long as
/// the returned future, so the bound is released on every exit path.
#[derive(Debug, Clone)]
pub struct DeadlineLayer {
    ceiling: Duration,
}

impl DeadlineLayer {
    #[must_use]
    pub fn new(ceiling: Duration) -> Self {
        Self { ceiling }
    }
}

impl Default for DeadlineLayer {
    fn default() -> Self {
        Self::new(CALL_DEADLINE_CEILING)
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            ceiling: self.ceiling,
        }
    }
}

// ---------------------------------------------------------------------------
// DeadlineService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
    ceiling: Duration,
}

impl<S> Service<Call> for DeadlineService<S>
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

    fn call(&mut self, mut call: Call) -> Self::Future {
        let (ctx, handle) = call.ctx.with_timeout(self.ceiling);
        call.ctx = ctx.clone();
        let fut = self.inner.call(call);

        Box::pin(async move {
            let _handle = handle;
            tokio::pin!(fut);

            let result = tokio::select! {
                biased;
                result = &mut fut => result,
                () = ctx.cancelled() => match fut.as_mut().now_or_never() {
                    Some(result) => result,
                    None => Err(CallError::Status(expired(&ctx))),
                },
            };
            result.map_err(|err| match err {
                CallError::Status(status) => CallError::Status(attribute_to_deadline(status, &ctx)),
                fatal @ CallError::Fatal(_) => fatal,
            })
        })
    }
}

/// Status for a call whose context ended before the handler returned.
fn expired(ctx: &CallContext) -> RpcError {
    match ctx.err() {
        Some(ContextError::Canceled) => RpcError::canceled("call canceled by the caller"),
        Some(ContextError::DeadlineExceeded) | None => {
            RpcError::deadline_exceeded("call exceeded its deadline")
        }
    }
}

/// A handler failure without an explicit status, raised once the deadline
/// elapsed, is reported as the deadline.
fn attribute_to_deadline(status: RpcError, ctx: &CallContext) -> RpcError {
    if status.code() != Code::Unknown || status.is_wire() {
        return status;
    }
    match ctx.err() {
        Some(ContextError::DeadlineExceeded) => {
            RpcError::deadline_exceeded("call exceeded its deadline").with_cause(status)
        }
        _ => status,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
