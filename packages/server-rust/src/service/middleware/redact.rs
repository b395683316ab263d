//! Captures a sanitized copy of each request before anything diagnostic
//! looks at it.

use std::task::{Context, Poll};

use portico_core::redact_message;
use tower::{Layer, Service};

use crate::service::call::{Call, CallError, CallFuture, Reply};

// ---------------------------------------------------------------------------
// RedactLayer
// ---------------------------------------------------------------------------

/// Tower layer that fills [`Call::diagnostics`] with the redacted request.
///
/// The decoded message handed to the handler is left as it is.
#[derive(Debug, Clone, Default)]
pub struct RedactLayer;

impl<S> Layer<S> for RedactLayer {
    type Service = RedactService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RedactService { inner }
    }
}

// ---------------------------------------------------------------------------
// RedactService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RedactService<S> {
    inner: S,
}

impl<S> Service<Call> for RedactService<S>
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
        call.diagnostics().set(redact_message(call.message.as_ref()));
        Box::pin(self.inner.call(call))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
