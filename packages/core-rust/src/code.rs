//! Wire status codes shared by every call outcome.
//!
//! The sixteen codes follow the Connect/gRPC vocabulary. Each code knows its
//! snake_case wire name, the HTTP status used by the unary JSON transport,
//! and whether a failure carrying it should reach the error-reporting sink.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Status code attached to every failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// The caller went away before the call completed.
    Canceled,
    /// Unclassified failure. Never leaves the server as-is.
    Unknown,
    /// The request is malformed regardless of server state.
    InvalidArgument,
    /// The per-call deadline elapsed.
    DeadlineExceeded,
    /// A requested entity does not exist.
    NotFound,
    /// The entity the caller tried to create already exists.
    AlreadyExists,
    /// The caller is authenticated but not allowed to do this.
    PermissionDenied,
    /// A quota or rate limit ran out.
    ResourceExhausted,
    /// The system is not in the state required for this call.
    FailedPrecondition,
    /// The operation was aborted, typically by a concurrency conflict.
    Aborted,
    /// A value was past the valid range.
    OutOfRange,
    /// The procedure is not implemented by this server.
    Unimplemented,
    /// Opaque server-side failure.
    Internal,
    /// The service is temporarily unavailable.
    Unavailable,
    /// Unrecoverable data loss or corruption.
    DataLoss,
    /// The caller did not provide valid credentials.
    Unauthenticated,
}

impl Code {
    /// Every code, in numeric order.
    pub const ALL: [Code; 16] = [
        Code::Canceled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Returns the snake_case name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// HTTP status used when this code is written by the unary JSON transport.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Code::Canceled => 499,
            Code::Unknown | Code::Internal | Code::DataLoss => 500,
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => 400,
            Code::DeadlineExceeded => 504,
            Code::NotFound => 404,
            Code::AlreadyExists | Code::Aborted => 409,
            Code::PermissionDenied => 403,
            Code::ResourceExhausted => 429,
            Code::Unimplemented => 501,
            Code::Unavailable => 503,
            Code::Unauthenticated => 401,
        }
    }

    /// Whether a failure with this code should be forwarded to the
    /// error-reporting sink.
    ///
    /// Caller-caused and already-understood operational codes are logged but
    /// never reported.
    #[must_use]
    pub const fn is_reportable(self) -> bool {
        !matches!(
            self,
            Code::InvalidArgument
                | Code::NotFound
                | Code::AlreadyExists
                | Code::FailedPrecondition
                | Code::Aborted
                | Code::Unimplemented
                | Code::Canceled
                | Code::Unauthenticated
                | Code::ResourceExhausted
                | Code::Unavailable
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognised code name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised status code: {0}")]
pub struct ParseCodeError(pub String);

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Code::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| ParseCodeError(s.to_string()))
    }
}

impl Serialize for Code {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_set_is_exactly_ten_codes() {
        let suppressed: Vec<Code> = Code::ALL
            .into_iter()
            .filter(|c| !c.is_reportable())
            .collect();
        assert_eq!(
            suppressed,
            vec![
                Code::Canceled,
                Code::InvalidArgument,
                Code::NotFound,
                Code::AlreadyExists,
                Code::ResourceExhausted,
                Code::FailedPrecondition,
                Code::Aborted,
                Code::Unimplemented,
                Code::Unavailable,
                Code::Unauthenticated,
            ]
        );
    }

    #[test]
    fn internal_unknown_and_deadline_are_reportable() {
        assert!(Code::Internal.is_reportable());
        assert!(Code::Unknown.is_reportable());
        assert!(Code::DeadlineExceeded.is_reportable());
        assert!(Code::DataLoss.is_reportable());
        assert!(Code::PermissionDenied.is_reportable());
    }

    #[test]
    fn wire_names_parse_back() {
        for code in Code::ALL {
            assert_eq!(code.as_str().parse::<Code>().unwrap(), code);
        }
        assert!("bogus".parse::<Code>().is_err());
    }

    #[test]
    fn http_statuses_follow_connect_mapping() {
        assert_eq!(Code::Canceled.http_status(), 499);
        assert_eq!(Code::InvalidArgument.http_status(), 400);
        assert_eq!(Code::DeadlineExceeded.http_status(), 504);
        assert_eq!(Code::NotFound.http_status(), 404);
        assert_eq!(Code::Unimplemented.http_status(), 501);
        assert_eq!(Code::Internal.http_status(), 500);
        assert_eq!(Code::Unauthenticated.http_status(), 401);
    }

    #[test]
    fn serializes_as_wire_name() {
        let json = serde_json::to_string(&Code::FailedPrecondition).unwrap();
        assert_eq!(json, "\"failed_precondition\"");
        let back: Code = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Code::FailedPrecondition);
    }
}
