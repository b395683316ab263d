//! HTTP middleware shared by listen ports and the RPC hub.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::shutdown::PortStatus;
use crate::service::hub::{DEFAULT_CORS_ORIGIN, TIMEOUT_HEADER};

/// How long browsers may cache a preflight answer.
const CORS_MAX_AGE: Duration = Duration::from_secs(300);

/// Builds the CORS layer for RPC services.
///
/// The default origin is always allowed; `origins` adds to it. A wildcard
/// `"*"` allows any origin.
#[must_use]
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = std::iter::once(DEFAULT_CORS_ORIGIN)
            .chain(origins.iter().map(String::as_str))
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(TIMEOUT_HEADER),
        ])
        .max_age(CORS_MAX_AGE)
}

/// Counts the request as in flight on its port until the response is ready.
///
/// Once the port is force-closed the handler is dropped and the peer gets a
/// 503.
pub async fn track_in_flight(
    State(status): State<PortStatus>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = status.in_flight_guard();
    let forced = status.forced();

    tokio::select! {
        biased;
        () = forced.cancelled() => {
            (StatusCode::SERVICE_UNAVAILABLE, "server shutting down\n").into_response()
        }
        response = next.run(request) => response,
    }
}
