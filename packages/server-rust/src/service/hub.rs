//! Connect-style unary JSON transport.
//!
//! The hub turns registered [`RpcService`]s into axum routes. Every
//! procedure is wrapped (outermost first) in CORS, the interceptor chain,
//! and then any user layers added with [`ConnectHub::with_layer`], so user
//! code always runs inside the classifier and the deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use portico_core::{CallContext, Code, RpcError};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error};

use super::call::{Call, CallError, Reply};
use super::middleware::{build_interceptor_chain, InterceptorConfig};
use super::procedure::{BoxCallService, DecodeFn, RpcService};
use crate::lifecycle::FatalHandler;
use crate::network::middleware::build_cors_layer;
use crate::network::ListenPort;

/// Largest accepted request body.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Header carrying the caller's deadline in milliseconds.
pub const TIMEOUT_HEADER: &str = "connect-timeout-ms";

/// Origin always allowed by the hub's CORS policy.
pub const DEFAULT_CORS_ORIGIN: &str = "https://studio.buf.build";

type WrapFn = Arc<dyn Fn(BoxCallService) -> BoxCallService + Send + Sync>;

// ---------------------------------------------------------------------------
// ConnectHub
// ---------------------------------------------------------------------------

/// Mounts RPC services with the server's interceptors, CORS policy and
/// fatal handler.
#[derive(Clone)]
pub struct ConnectHub {
    interceptors: InterceptorConfig,
    cors_origins: Vec<String>,
    fatal: Arc<dyn FatalHandler>,
    layers: Vec<WrapFn>,
}

impl ConnectHub {
    #[must_use]
    pub fn new(interceptors: InterceptorConfig, fatal: Arc<dyn FatalHandler>) -> Self {
        Self {
            interceptors,
            cors_origins: Vec::new(),
            fatal,
            layers: Vec::new(),
        }
    }

    /// Adds origins to the CORS allowlist; [`DEFAULT_CORS_ORIGIN`] is always
    /// on it.
    #[must_use]
    pub fn with_cors_origins<I, O>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<String>,
    {
        self.cors_origins.extend(origins.into_iter().map(Into::into));
        self
    }

    /// Adds a user interceptor. Interceptors added first run first; all of
    /// them run inside the built-in chain.
    #[must_use]
    pub fn with_layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<BoxCallService> + Send + Sync + 'static,
        L::Service: Service<Call, Response = Reply, Error = CallError> + Clone + Send + Sync + 'static,
        <L::Service as Service<Call>>::Future: Send + 'static,
    {
        self.layers
            .push(Arc::new(move |inner| BoxCloneSyncService::new(layer.layer(inner))));
        self
    }

    #[must_use]
    pub fn interceptors(&self) -> &InterceptorConfig {
        &self.interceptors
    }

    /// Receives role-guard violations raised by mounted procedures.
    #[must_use]
    pub fn fatal_handler(&self) -> Arc<dyn FatalHandler> {
        Arc::clone(&self.fatal)
    }

    /// Builds the routes for `service`.
    ///
    /// Methods the service does not define answer `unimplemented`.
    #[must_use]
    pub fn router(&self, service: RpcService) -> Router {
        let unknown_methods = format!("{}{{*method}}", service.path_prefix());
        let mut router = Router::new().route(&unknown_methods, any(unimplemented_procedure));

        for procedure in service.into_procedures() {
            let endpoint = Arc::new(Endpoint {
                path: procedure.path.clone(),
                decode: procedure.decode,
                service: self.wrap(procedure.handler),
                fatal: Arc::clone(&self.fatal),
            });
            router = router.route(
                &procedure.path,
                post(move |req: Request| {
                    let endpoint = Arc::clone(&endpoint);
                    async move { endpoint.handle(req).await }
                }),
            );
        }

        router.layer(build_cors_layer(&self.cors_origins))
    }

    /// Builds the routes for `service` and merges them into `port`.
    pub fn mount(&self, port: &mut ListenPort, service: RpcService) {
        debug!(service = service.name(), port = port.name(), "Mounting RPC service");
        port.merge(self.router(service));
    }

    fn wrap(&self, handler: BoxCallService) -> BoxCallService {
        let handler = self
            .layers
            .iter()
            .rev()
            .fold(handler, |inner, wrap| wrap(inner));
        BoxCloneSyncService::new(build_interceptor_chain(handler, &self.interceptors))
    }
}

impl std::fmt::Debug for ConnectHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectHub")
            .field("interceptors", &self.interceptors)
            .field("cors_origins", &self.cors_origins)
            .field("layers", &self.layers.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One procedure's HTTP binding.
struct Endpoint {
    path: String,
    decode: DecodeFn,
    service: BoxCallService,
    fatal: Arc<dyn FatalHandler>,
}

impl Endpoint {
    async fn handle(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();

        if !is_json(&parts.headers) {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "expected content-type application/json\n",
            )
                .into_response();
        }
        let timeout = match caller_timeout(&parts.headers) {
            Ok(timeout) => timeout,
            Err(err) => return status_response(&err),
        };
        let body = match axum::body::to_bytes(body, MAX_MESSAGE_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                return status_response(&RpcError::invalid_argument(format!(
                    "reading request body: {e}"
                )))
            }
        };
        let message = match (self.decode)(&body) {
            Ok(message) => message,
            Err(err) => return status_response(&err),
        };

        // The call runs on its own task; dropping this future (the peer went
        // away) only cancels its context, so the classifier still sees the
        // outcome.
        let root = CallContext::background();
        let disconnect = root.cancel_on_drop();
        let (ctx, caller_deadline) = match timeout {
            Some(timeout) => {
                let (ctx, handle) = root.with_timeout(timeout);
                (ctx, Some(handle))
            }
            None => (root.clone(), None),
        };

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());
        let mut call = Call::new(self.path.clone(), message)
            .with_headers(parts.headers)
            .with_peer(peer)
            .with_context(ctx);
        call.http_method = parts.method;

        let service = self.service.clone();
        let running = tokio::spawn(async move {
            let _caller_deadline = caller_deadline;
            service.oneshot(call).await
        });
        let result = running.await;
        disconnect.disarm();

        match result {
            Ok(Ok(reply)) => Json(reply.message).into_response(),
            Ok(Err(CallError::Status(err))) => status_response(&err),
            Ok(Err(CallError::Fatal(err))) => {
                self.fatal.fatal(err);
                std::future::pending::<Response>().await
            }
            Err(e) => {
                error!(procedure = %self.path, error = %e, "Call task did not complete");
                status_response(&RpcError::internal())
            }
        }
    }
}

async fn unimplemented_procedure(req: Request) -> Response {
    status_response(&RpcError::unimplemented(format!(
        "{} is not implemented",
        req.uri().path()
    )))
}

/// Writes `err` as a Connect unary error.
#[must_use]
pub fn status_response(err: &RpcError) -> Response {
    let status =
        StatusCode::from_u16(err.code().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_wire())).into_response()
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

fn caller_timeout(headers: &HeaderMap) -> Result<Option<Duration>, RpcError> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|millis| Some(Duration::from_millis(millis)))
        .ok_or_else(|| {
            RpcError::new(
                Code::InvalidArgument,
                format!("{TIMEOUT_HEADER} must be a non-negative integer"),
            )
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Method;
    use parking_lot::Mutex;
    use portico_core::ConfigError;
    use serde::Serialize;

    use super::*;
    use crate::service::call::CallFuture;
    use crate::service::middleware::testing::EchoRequest;

    #[derive(Debug, Serialize)]
    struct EchoResponse {
        text: String,
    }

    #[derive(Default)]
    struct RecordingFatal(Mutex<Vec<ConfigError>>);

    impl FatalHandler for Arc<RecordingFatal> {
        fn fatal(&self, err: ConfigError) {
            self.0.lock().push(err);
        }
    }

    fn hub() -> ConnectHub {
        ConnectHub::new(
            InterceptorConfig::default(),
            Arc::new(Arc::new(RecordingFatal::default())),
        )
    }

    fn echo_service() -> RpcService {
        RpcService::new("test.v1.EchoService")
            .unary("Echo", |_ctx: CallContext, req: Arc<EchoRequest>| async move {
                Ok(EchoResponse {
                    text: req.text.clone(),
                })
            })
            .unary("Fail", |_ctx: CallContext, _req: Arc<EchoRequest>| async move {
                Err::<EchoResponse, _>(RpcError::from(anyhow::anyhow!("db password leaked")))
            })
    }

    fn json_request(path: &str, body: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unary_call_round_trip() {
        let router = hub().router(echo_service());
        let response = router
            .oneshot(json_request("/test.v1.EchoService/Echo", r#"{"text":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn unclassified_errors_are_opaque_on_the_wire() {
        let router = hub().router(echo_service());
        let response = router
            .oneshot(json_request("/test.v1.EchoService/Fail", r#"{"text":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"code": "internal", "message": "internal server error"})
        );
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_argument() {
        let router = hub().router(echo_service());
        let response = router
            .oneshot(json_request("/test.v1.EchoService/Echo", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let router = hub().router(echo_service());
        let response = router
            .oneshot(json_request("/test.v1.EchoService/Nope", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body_json(response).await["code"], "unimplemented");
    }

    #[tokio::test]
    async fn non_json_requests_are_rejected() {
        let router = hub().router(echo_service());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/test.v1.EchoService/Echo")
            .header(header::CONTENT_TYPE, "application/proto")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timeout_header_bounds_the_call() {
        let service = RpcService::new("test.v1.EchoService").unary(
            "Slow",
            |_ctx: CallContext, _req: Arc<EchoRequest>| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(EchoResponse {
                    text: String::new(),
                })
            },
        );
        let mut request = json_request("/test.v1.EchoService/Slow", r#"{"text":"x"}"#);
        request
            .headers_mut()
            .insert(TIMEOUT_HEADER, "500".parse().unwrap());

        let response = hub().router(service).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], "deadline_exceeded");
    }

    #[tokio::test]
    async fn bad_timeout_header_is_invalid_argument() {
        let mut request = json_request("/test.v1.EchoService/Echo", r#"{"text":"x"}"#);
        request
            .headers_mut()
            .insert(TIMEOUT_HEADER, "soon".parse().unwrap());
        let response = hub().router(echo_service()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cors_preflight_allows_default_origin() {
        let router = hub().router(echo_service());
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/test.v1.EchoService/Echo")
            .header(header::ORIGIN, DEFAULT_CORS_ORIGIN)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            DEFAULT_CORS_ORIGIN
        );
    }

    #[tokio::test]
    async fn user_layers_run_inside_the_chain() {
        #[derive(Clone)]
        struct Stamp;

        #[derive(Clone)]
        struct StampService(BoxCallService);

        impl Layer<BoxCallService> for Stamp {
            type Service = StampService;

            fn layer(&self, inner: BoxCallService) -> StampService {
                StampService(inner)
            }
        }

        impl Service<Call> for StampService {
            type Response = Reply;
            type Error = CallError;
            type Future = CallFuture;

            fn poll_ready(
                &mut self,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), CallError>> {
                self.0.poll_ready(cx)
            }

            fn call(&mut self, call: Call) -> CallFuture {
                // Runs after the deadline layer and the redactor.
                let bounded = call.ctx.deadline().is_some();
                let redacted = call.diagnostics().get().is_some();
                let fut = self.0.call(call);
                Box::pin(async move {
                    let mut reply = fut.await?;
                    reply.message["bounded"] = serde_json::json!(bounded);
                    reply.message["redacted"] = serde_json::json!(redacted);
                    Ok(reply)
                })
            }
        }

        let router = hub().with_layer(Stamp).router(echo_service());
        let response = router
            .oneshot(json_request("/test.v1.EchoService/Echo", r#"{"text":"hi"}"#))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"text": "hi", "bounded": true, "redacted": true})
        );
    }

    #[tokio::test]
    async fn fatal_errors_reach_the_handler_and_never_respond() {
        #[derive(Clone)]
        struct ClientRole;

        #[derive(Clone)]
        struct ClientRoleService(BoxCallService);

        impl Layer<BoxCallService> for ClientRole {
            type Service = ClientRoleService;

            fn layer(&self, inner: BoxCallService) -> ClientRoleService {
                ClientRoleService(inner)
            }
        }

        impl Service<Call> for ClientRoleService {
            type Response = Reply;
            type Error = CallError;
            type Future = CallFuture;

            fn poll_ready(
                &mut self,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Result<(), CallError>> {
                self.0.poll_ready(cx)
            }

            fn call(&mut self, call: Call) -> CallFuture {
                Box::pin(async move {
                    Err(CallError::Fatal(ConfigError::ServerInterceptorOnClient {
                        procedure: call.procedure,
                    }))
                })
            }
        }

        let recorder = Arc::new(RecordingFatal::default());
        let hub = ConnectHub::new(InterceptorConfig::default(), Arc::new(Arc::clone(&recorder)))
            .with_layer(ClientRole);
        let router = hub.router(echo_service());

        let pending = tokio::time::timeout(
            Duration::from_millis(200),
            router.oneshot(json_request("/test.v1.EchoService/Echo", r#"{"text":"hi"}"#)),
        )
        .await;

        assert!(pending.is_err(), "a fatal call must not be answered");
        assert_eq!(recorder.0.lock().len(), 1);
    }
}
