//! Pipeline composition: combines all interceptors into a single service stack.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::classify::{ClassifyLayer, ClassifyService};
use super::deadline::{DeadlineLayer, DeadlineService, CALL_DEADLINE_CEILING};
use super::redact::{RedactLayer, RedactService};
use super::role_guard::{RoleGuardLayer, RoleGuardService};
use crate::service::call::{Call, CallError, Reply};
use crate::service::report::{ErrorReporter, NoopReporter};

/// Settings shared by every interceptor chain of a server.
#[derive(Clone)]
pub struct InterceptorConfig {
    /// Upper bound on each call's lifetime.
    pub ceiling: Duration,
    /// Expose error chains in `internal` responses (local development).
    pub verbose_errors: bool,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            ceiling: CALL_DEADLINE_CEILING,
            verbose_errors: false,
            reporter: Arc::new(NoopReporter),
        }
    }
}

impl std::fmt::Debug for InterceptorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorConfig")
            .field("ceiling", &self.ceiling)
            .field("verbose_errors", &self.verbose_errors)
            .finish_non_exhaustive()
    }
}

/// The composed chain around a handler `S`.
pub type InterceptorChain<S> =
    ClassifyService<RoleGuardService<DeadlineService<RedactService<S>>>>;

/// Wraps `handler` with the interceptors.
///
/// Layer order (outermost to innermost):
/// 1. `ClassifyLayer` -- sees panics and errors from every inner stage
/// 2. `RoleGuardLayer` -- short-circuits before any work begins
/// 3. `DeadlineLayer` -- the bound is active before the handler runs
/// 4. `RedactLayer` -- sanitized copy exists before anything diagnostic
#[must_use]
pub fn build_interceptor_chain<S>(handler: S, config: &InterceptorConfig) -> InterceptorChain<S>
where
    S: tower::Service<Call, Response = Reply, Error = CallError> + Send,
    S::Future: Send + 'static,
{
    ServiceBuilder::new()
        .layer(ClassifyLayer::new(
            Arc::clone(&config.reporter),
            config.verbose_errors,
        ))
        .layer(RoleGuardLayer)
        .layer(DeadlineLayer::new(config.ceiling))
        .layer(RedactLayer)
        .service(handler)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use portico_core::{Code, ConfigError, RpcError};
    use tower::ServiceExt;

    use super::*;
    use crate::service::call::{CallFuture, Role};
    use crate::service::middleware::testing::{call, echo};
    use crate::service::report::ErrorReport;

    #[tokio::test]
    async fn chain_routes_through_all_layers() {
        let svc = build_interceptor_chain(echo(), &InterceptorConfig::default());
        let reply = svc.oneshot(call("hello")).await.unwrap();
        assert_eq!(reply.message["text"], "hello");
    }

    #[tokio::test]
    async fn handler_observes_deadline_and_sanitized_copy() {
        let handler = tower::service_fn(|call: Call| async move {
            Ok::<_, CallError>(Reply {
                message: serde_json::json!({
                    "bounded": call.ctx.deadline().is_some(),
                    "redacted": call.diagnostics().get().is_some(),
                }),
            })
        });
        let svc = build_interceptor_chain(handler, &InterceptorConfig::default());
        let reply = svc.oneshot(call("hi")).await.unwrap();
        assert_eq!(
            reply.message,
            serde_json::json!({"bounded": true, "redacted": true})
        );
    }

    #[tokio::test]
    async fn role_guard_runs_before_the_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&ran);
        let handler = tower::service_fn(move |_call: Call| -> CallFuture {
            seen.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(Reply { message: serde_json::Value::Null }) })
        });

        let svc = build_interceptor_chain(handler, &InterceptorConfig::default());
        let result = svc.oneshot(call("hi").with_role(Role::Client)).await;
        assert!(matches!(
            result,
            Err(CallError::Fatal(ConfigError::ServerInterceptorOnClient { .. }))
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_are_reported_with_the_redacted_request() {
        let reports: Arc<Mutex<Vec<Option<serde_json::Value>>>> = Arc::default();
        let sink = Arc::clone(&reports);
        let config = InterceptorConfig {
            reporter: Arc::new(move |report: &ErrorReport<'_>| {
                sink.lock().push(report.request.cloned());
            }),
            ..InterceptorConfig::default()
        };
        let handler = tower::service_fn(|_call: Call| -> CallFuture {
            Box::pin(async {
                if true {
                    panic!("handler bug");
                }
                Ok(Reply {
                    message: serde_json::Value::Null,
                })
            })
        });

        let result = build_interceptor_chain(handler, &config)
            .oneshot(call("hi"))
            .await;
        let Err(CallError::Status(err)) = result else {
            panic!("expected a status");
        };
        assert_eq!(err.code(), Code::Internal);

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0],
            Some(serde_json::json!({"text": "hi", "token": ""}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_resolves_to_deadline_exceeded() {
        let config = InterceptorConfig {
            ceiling: Duration::from_secs(1),
            ..InterceptorConfig::default()
        };
        let handler = tower::service_fn(|_call: Call| -> CallFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Err(CallError::Status(RpcError::internal()))
            })
        });

        let result = build_interceptor_chain(handler, &config)
            .oneshot(call("hi"))
            .await;
        let Err(CallError::Status(err)) = result else {
            panic!("expected a status");
        };
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }
}
