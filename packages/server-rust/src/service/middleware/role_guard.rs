//! Rejects calls that reach server interceptors in the client role.

use std::task::{Context, Poll};

use portico_core::ConfigError;
use tower::{Layer, Service};

use crate::service::call::{Call, CallError, CallFuture, Reply, Role};

// ---------------------------------------------------------------------------
// RoleGuardLayer
// ---------------------------------------------------------------------------

/// Tower layer that turns a client-role call into [`CallError::Fatal`].
///
/// The inner service is never invoked for such a call.
#[derive(Debug, Clone, Default)]
pub struct RoleGuardLayer;

impl<S> Layer<S> for RoleGuardLayer {
    type Service = RoleGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RoleGuardService { inner }
    }
}

// ---------------------------------------------------------------------------
// RoleGuardService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RoleGuardService<S> {
    inner: S,
}

impl<S> Service<Call> for RoleGuardService<S>
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
        if call.role == Role::Client {
            let err = ConfigError::ServerInterceptorOnClient {
                procedure: call.procedure,
            };
            return Box::pin(async move { Err(CallError::Fatal(err)) });
        }
        Box::pin(self.inner.call(call))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::testing::{call, echo};

    #[tokio::test]
    async fn server_calls_pass_through() {
        let svc = RoleGuardLayer.layer(echo());
        let reply = svc.oneshot(call("hello")).await.unwrap();
        assert_eq!(reply.message["text"], "hello");
    }

    #[tokio::test]
    async fn client_calls_are_fatal_and_skip_the_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&ran);
        let handler = tower::service_fn(move |_call: Call| {
            seen.store(true, Ordering::SeqCst);
            async { Ok::<_, CallError>(Reply { message: serde_json::Value::Null }) }
        });

        let svc = RoleGuardLayer.layer(handler);
        let err = svc
            .oneshot(call("hello").with_role(Role::Client))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CallError::Fatal(ConfigError::ServerInterceptorOnClient { ref procedure })
                if procedure == "/test.v1.EchoService/Echo"
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
