//! Classified call errors and the fatal configuration error class.

use std::error::Error as StdError;
use std::fmt;

use serde::Serialize;

use crate::code::Code;

/// Message sent to callers in place of any internal failure detail.
pub const INTERNAL_MESSAGE: &str = "internal server error";

/// A call failure carrying a wire status code.
///
/// `RpcError` is what handlers return and what the transport serializes.
/// Besides the code and message it remembers:
/// - whether it was received from another RPC peer (`wire`), which is never
///   shown to callers;
/// - whether the classifier already produced it (`classified`), so it is
///   never wrapped twice.
pub struct RpcError {
    code: Code,
    message: String,
    cause: Option<anyhow::Error>,
    wire: bool,
    classified: bool,
}

impl RpcError {
    /// Creates an error with an explicit status code.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            wire: false,
            classified: false,
        }
    }

    /// An error that arrived over the wire from another RPC peer, e.g. the
    /// failure of an outbound call made while handling this one.
    ///
    /// Wire errors are always collapsed to `internal` before reaching a
    /// caller; the remote code only drives logging and reporting.
    pub fn wire(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            wire: true,
            classified: false,
        }
    }

    /// Attaches the underlying cause without changing the visible message.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// The generic opaque failure returned in place of implementation detail.
    #[must_use]
    pub fn internal() -> Self {
        Self::new(Code::Internal, INTERNAL_MESSAGE)
    }

    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref()
    }

    /// Whether the error was received from another RPC peer.
    #[must_use]
    pub fn is_wire(&self) -> bool {
        self.wire
    }

    /// Whether the classifier already produced this error.
    #[must_use]
    pub fn is_classified(&self) -> bool {
        self.classified
    }

    /// Marks the error as produced by the server's classifier. Handlers
    /// have no use for this; a marked error skips logging and reporting.
    #[doc(hidden)]
    #[must_use]
    pub fn __into_classified(mut self) -> Self {
        self.classified = true;
        self
    }

    /// Renders the full cause chain, one `: `-separated line.
    #[must_use]
    pub fn detail(&self) -> String {
        match &self.cause {
            Some(cause) if cause.to_string() != self.message => {
                format!("{}: {cause:#}", self.message)
            }
            Some(cause) => format!("{cause:#}"),
            None => self.message.clone(),
        }
    }

    /// Body written by the unary JSON transport for this error.
    #[must_use]
    pub fn to_wire(&self) -> WireError<'_> {
        WireError {
            code: self.code,
            message: &self.message,
        }
    }
}

impl fmt::Debug for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause)
            .field("wire", &self.wire)
            .field("classified", &self.classified)
            .finish()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for RpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

/// Unclassified failures keep `Code::Unknown` until the classifier decides.
impl From<anyhow::Error> for RpcError {
    fn from(cause: anyhow::Error) -> Self {
        Self {
            code: Code::Unknown,
            message: cause.to_string(),
            cause: Some(cause),
            wire: false,
            classified: false,
        }
    }
}

/// Connect JSON error body.
#[derive(Debug, Serialize)]
pub struct WireError<'a> {
    pub code: Code,
    pub message: &'a str,
}

/// Builds an [`RpcError`] from a code and a format string.
///
/// ```
/// use portico_core::{rpc_error, Code};
///
/// let err = rpc_error!(Code::NotFound, "user {} not found", 42);
/// assert_eq!(err.code(), Code::NotFound);
/// assert_eq!(err.message(), "user 42 not found");
/// ```
#[macro_export]
macro_rules! rpc_error {
    ($code:expr, $($arg:tt)+) => {
        $crate::RpcError::new($code, format!($($arg)+))
    };
}

/// A build-time misconfiguration detected while handling a call.
///
/// Never turned into a wire response: the process stops instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("server interceptors attached to a client call: {procedure}")]
    ServerInterceptorOnClient { procedure: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_errors_stay_unclassified() {
        let err: RpcError = anyhow::anyhow!("database exploded").into();
        assert_eq!(err.code(), Code::Unknown);
        assert!(!err.is_wire());
        assert!(!err.is_classified());
        assert_eq!(err.message(), "database exploded");
    }

    #[test]
    fn wire_errors_are_flagged() {
        let err = RpcError::wire(Code::Unavailable, "upstream unavailable")
            .with_cause(anyhow::anyhow!("connection reset by peer"));
        assert!(err.is_wire());
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.source().is_some());
    }

    #[test]
    fn detail_includes_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("writing journal");
        let err = RpcError::new(Code::Internal, "save failed").with_cause(cause);
        assert_eq!(err.detail(), "save failed: writing journal: disk full");
    }

    #[test]
    fn wire_body_has_code_and_message() {
        let err = RpcError::not_found("no such user");
        let json = serde_json::to_value(err.to_wire()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"code": "not_found", "message": "no such user"})
        );
    }

    #[test]
    fn rpc_error_macro_formats() {
        let err = rpc_error!(Code::InvalidArgument, "bad field {}", "email");
        assert_eq!(err.to_string(), "invalid_argument: bad field email");
    }

    #[test]
    fn handler_built_errors_start_unclassified() {
        let built = [
            RpcError::new(Code::Internal, "boom"),
            RpcError::internal(),
            RpcError::wire(Code::Internal, "remote boom"),
            RpcError::not_found("gone").with_cause(anyhow::anyhow!("row missing")),
            rpc_error!(Code::DataLoss, "lost {}", "page"),
            anyhow::anyhow!("boom").into(),
        ];
        for err in built {
            assert!(!err.is_classified(), "{err:?}");
        }
    }

    #[test]
    fn into_classified_sets_flag() {
        let err = RpcError::internal().__into_classified();
        assert!(err.is_classified());
    }
}
