//! Error-reporting sink.
//!
//! The classifier hands every reportable failure to an [`ErrorReporter`]
//! together with the simulated request: redacted payload, headers without
//! credentials, peer and host. Transport to the external service is the
//! reporter's business.

use std::collections::BTreeMap;

use axum::http::{header, HeaderMap};
use portico_core::RpcError;
use uuid::Uuid;

/// Headers never forwarded to a reporting sink.
const CREDENTIAL_HEADERS: [header::HeaderName; 3] = [
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Everything a sink gets to know about one failed call.
#[derive(Debug)]
pub struct ErrorReport<'a> {
    pub call_id: Uuid,
    pub procedure: &'a str,
    pub error: &'a RpcError,
    /// Redacted request message, when the redactor ran.
    pub request: Option<&'a serde_json::Value>,
    pub headers: BTreeMap<String, String>,
    pub peer: Option<&'a str>,
    pub host: Option<&'a str>,
    pub http_method: &'a str,
}

/// Collapses a header map into sink-safe pairs. Credential headers and
/// values that are not valid text are dropped; repeated headers are joined
/// with `", "`.
#[must_use]
pub fn report_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if CREDENTIAL_HEADERS.contains(name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

/// External error-reporting sink.
///
/// Called synchronously from the classifier; implementations should hand
/// the report off rather than block.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, report: &ErrorReport<'_>);
}

impl<F> ErrorReporter for F
where
    F: Fn(&ErrorReport<'_>) + Send + Sync + 'static,
{
    fn report(&self, report: &ErrorReport<'_>) {
        self(report);
    }
}

/// Drops every report. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _report: &ErrorReport<'_>) {}
}

/// Forwards reports to Sentry through the process-wide hub.
#[cfg(feature = "sentry")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SentryReporter;

#[cfg(feature = "sentry")]
impl ErrorReporter for SentryReporter {
    fn report(&self, report: &ErrorReport<'_>) {
        let request = sentry::protocol::Request {
            url: report
                .host
                .and_then(|host| format!("https://{host}{}", report.procedure).parse().ok()),
            method: Some(report.http_method.to_string()),
            data: report.request.map(ToString::to_string),
            headers: report.headers.clone(),
            ..Default::default()
        };

        sentry::with_scope(
            |scope| {
                scope.set_tag("procedure", report.procedure);
                scope.set_tag("code", report.error.code().as_str());
                scope.set_tag("call_id", report.call_id);
                if let Some(peer) = report.peer {
                    scope.set_extra("peer", peer.into());
                }
                scope.add_event_processor(move |mut event| {
                    event.request = Some(request.clone());
                    Some(event)
                });
            },
            || {
                sentry::capture_error(report.error);
            },
        );
    }
}
