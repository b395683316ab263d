//! Health endpoint handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::network::config::ServiceInfo;

/// Always `200 text/plain`: `"<service> <version> is ok\n"`.
///
/// Reaching the handler is the health check; nothing downstream is checked.
pub async fn health_handler(State(service): State<Arc<ServiceInfo>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{} {} is ok\n", service.name, service.version),
    )
}
