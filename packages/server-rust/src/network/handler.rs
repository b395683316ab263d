//! Plain HTTP handlers with the same safety net as RPC calls.
//!
//! [`fallible`] wraps an `async fn(Request) -> anyhow::Result<Response>` so
//! that failures are bounded by the call ceiling, panics are recovered, and
//! errors are logged and reported once before an error page goes out.
//! [`std_layers`] is the coarser variant for whole routers: timeout and
//! panic recovery without reporting.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use portico_core::{CallContext, ContextError, RpcError};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::error;
use uuid::Uuid;

use crate::service::middleware::classify::panic_error;
use crate::service::middleware::InterceptorConfig;
use crate::service::report::{report_headers, ErrorReport};

/// Layer stack returned by [`std_layers`].
pub type StdLayers = tower::layer::util::Stack<
    TimeoutLayer,
    tower::layer::util::Stack<
        CatchPanicLayer<tower_http::catch_panic::DefaultResponseForPanic>,
        tower::layer::util::Identity,
    >,
>;

/// Timeout and panic recovery for a router of plain handlers.
///
/// A request running past `ceiling` gets a 504; a panicking handler gets a
/// 500.
#[must_use]
pub fn std_layers(ceiling: Duration) -> StdLayers {
    ServiceBuilder::new()
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            ceiling,
        ))
        .into_inner()
}

/// Minimal HTML page for an error status.
#[must_use]
pub fn error_page(status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or("Error");
    let code = status.as_u16();
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1></body></html>\n"
    );
    (status, Html(body)).into_response()
}

/// Wraps a fallible handler for use with `axum::routing`.
///
/// The handler can extract the request's [`CallContext`] from the request
/// extensions; it carries the ceiling from `config` and is cancelled when
/// the peer goes away.
///
/// Outcomes:
/// - `Ok(response)` is sent as is.
/// - An error while the context reports `Canceled` becomes a bare 408 and
///   is not logged.
/// - Anything else (including a panic) is logged and handed to the
///   reporter, then answered with 504 if the ceiling elapsed, or 500: the
///   error chain in local development, the HTML error page otherwise.
pub fn fallible<F, Fut>(
    config: &InterceptorConfig,
    handler: F,
) -> impl Fn(Request) -> BoxFuture<'static, Response> + Clone + Send + Sync + 'static
where
    F: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    let config = config.clone();
    move |request: Request| {
        let handler = handler.clone();
        let config = config.clone();
        run_fallible(handler, config, request).boxed()
    }
}

/// Runs the handler on its own task. The request future only holds the
/// disconnect guard, so a peer going away cancels the handler's context
/// instead of dropping the handler.
async fn run_fallible<F, Fut>(handler: F, config: InterceptorConfig, mut request: Request) -> Response
where
    F: FnOnce(Request) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    let info = RequestInfo::from_request(&request);

    let root = CallContext::background();
    let disconnect = root.cancel_on_drop();
    let (ctx, deadline) = root.with_timeout(config.ceiling);
    request.extensions_mut().insert(ctx.clone());

    let running = tokio::spawn(async move {
        let _deadline = deadline;
        let outcome = {
            let work = AssertUnwindSafe(async move { handler(request).await }).catch_unwind();
            tokio::pin!(work);
            tokio::select! {
                biased;
                result = &mut work => Some(result),
                () = ctx.cancelled() => None,
            }
        };

        let err = match outcome {
            Some(Ok(Ok(response))) => return response,
            Some(Ok(Err(err))) => RpcError::from(err),
            Some(Err(payload)) => panic_error(payload.as_ref()),
            None => RpcError::deadline_exceeded("handler did not finish before the deadline"),
        };
        failure_response(err, &ctx, &info, &config)
    });

    let response = match running.await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "HTTP handler task did not complete");
            error_page(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    disconnect.disarm();
    response
}

fn failure_response(
    err: RpcError,
    ctx: &CallContext,
    info: &RequestInfo,
    config: &InterceptorConfig,
) -> Response {
    let cause = ctx.err();
    if cause == Some(ContextError::Canceled) {
        return StatusCode::REQUEST_TIMEOUT.into_response();
    }

    let detail = err.detail();
    error!(
        code = err.code().as_str(),
        status_message = err.message(),
        path = %info.path,
        request_id = %info.id,
        detail = %detail,
        "HTTP handler failed"
    );
    config.reporter.report(&ErrorReport {
        call_id: info.id,
        procedure: &info.path,
        error: &err,
        request: None,
        headers: report_headers(&info.headers),
        peer: info.peer.as_deref(),
        host: info.host(),
        http_method: info.method.as_str(),
    });

    if cause == Some(ContextError::DeadlineExceeded) {
        error_page(StatusCode::GATEWAY_TIMEOUT)
    } else if config.verbose_errors {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{detail}\n")).into_response()
    } else {
        error_page(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// What the failure path needs once the request has been handed over.
struct RequestInfo {
    id: Uuid,
    method: axum::http::Method,
    path: String,
    headers: HeaderMap,
    peer: Option<String>,
}

impl RequestInfo {
    fn from_request(request: &Request) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
            peer: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.to_string()),
        }
    }

    fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
