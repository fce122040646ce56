//! # Error Handling for the Middleware Stack
//!
//! This module defines the centralized error handling for the crate. It
//! provides a unified `Result` type, the [`Status`] error that travels across
//! the RPC boundary, and the [`ConfigError`] type reported by middleware
//! constructors when they are handed an invalid configuration.
//!
//! ## The `Status` Type
//!
//! [`Status`] is the one error shape every middleware produces and consumes.
//! It pairs a [`Code`] from the RPC status family with a human-readable
//! message, and optionally preserves an underlying cause in a form that can
//! be walked with [`std::error::Error::source`].
//!
//! Middleware-originated rejections use a fixed subset of codes:
//!
//! - rate limiting rejects with [`Code::ResourceExhausted`],
//! - an open circuit breaker rejects with [`Code::Unavailable`],
//! - deadline expiry surfaces as [`Code::DeadlineExceeded`],
//! - explicit cancellation surfaces as [`Code::Cancelled`].
//!
//! Handler-originated statuses are passed through verbatim.
//!
//! ### Example
//!
//! ```rust
//! use rampart::error::{Code, Status};
//!
//! let status = Status::unavailable("backend is draining");
//! assert_eq!(status.code(), Code::Unavailable);
//! assert_eq!(status.to_string(), "unavailable: backend is draining");
//! ```

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type whose error is a wire [`Status`].
pub type Result<T> = std::result::Result<T, Status>;

/// RPC status codes, mirroring the conventional status family used by
/// framed-RPC transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// Not an error.
    Ok,
    /// The operation was cancelled, typically by the caller.
    Cancelled,
    /// Unknown error, e.g. a foreign error without a status.
    Unknown,
    /// The client specified an invalid argument.
    InvalidArgument,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded,
    /// Some requested entity was not found.
    NotFound,
    /// The entity that a client attempted to create already exists.
    AlreadyExists,
    /// The caller does not have permission to execute the operation.
    PermissionDenied,
    /// Some resource has been exhausted, e.g. a rate limit.
    ResourceExhausted,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The operation was aborted, e.g. a concurrency conflict.
    Aborted,
    /// The operation was attempted past the valid range.
    OutOfRange,
    /// The operation is not implemented.
    Unimplemented,
    /// An internal invariant was broken.
    Internal,
    /// The service is currently unavailable.
    Unavailable,
    /// Unrecoverable data loss or corruption.
    DataLoss,
    /// The request lacks valid authentication credentials.
    Unauthenticated,
}

impl Code {
    /// Returns the lowercase wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid argument",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::NotFound => "not found",
            Code::AlreadyExists => "already exists",
            Code::PermissionDenied => "permission denied",
            Code::ResourceExhausted => "resource exhausted",
            Code::FailedPrecondition => "failed precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out of range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type carried across the RPC boundary.
///
/// A `Status` is cheap to clone; the optional underlying cause is reference
/// counted and exposed through [`std::error::Error::source`] so callers can
/// walk the chain.
#[derive(Clone)]
pub struct Status {
    code: Code,
    message: String,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl Status {
    /// Creates a new `Status` with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// The operation was cancelled.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// Unknown error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    /// The client specified an invalid argument.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// The deadline expired before the operation could complete.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    /// Some requested entity was not found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// The caller does not have permission.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    /// Some resource has been exhausted.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    /// The operation was aborted.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    /// An internal invariant was broken.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// The service is currently unavailable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// The request lacks valid authentication credentials.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    /// Attaches an underlying cause, preserved through `Error::source`.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Returns the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for Status {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Status {
    fn from(err: serde_json::Error) -> Self {
        Status::internal("serialization failed").with_source(err)
    }
}

/// Errors reported by middleware constructors for invalid configuration.
///
/// Constructors are total: a bad knob is reported here rather than panicking
/// at first use.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration field holds a value outside its allowed range.
    #[error("invalid {field}: {reason}")]
    InvalidOption {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A chain entry invoked its inner handler more than once without being
    /// a retrying middleware.
    #[error("middleware {name:?} invoked its inner handler {calls} times in one pass")]
    ReinvokedHandler {
        /// Name of the offending chain entry.
        name: String,
        /// Observed invocation count.
        calls: usize,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidOption {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_includes_code_and_message() {
        let status = Status::resource_exhausted("rate limit exceeded");
        assert_eq!(status.to_string(), "resource exhausted: rate limit exceeded");

        let status = Status::deadline_exceeded("request timeout after 100ms");
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn status_source_is_chain_walkable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let status = Status::unavailable("mTLS validation failed").with_source(io);

        let source = StdError::source(&status).expect("source preserved");
        assert!(source.to_string().contains("peer reset"));
    }

    #[test]
    fn code_round_trips_through_serde() {
        let encoded = serde_json::to_string(&Code::Unavailable).unwrap();
        let decoded: Code = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Code::Unavailable);
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::invalid("max_attempts", "must be at least 1");
        assert_eq!(err.to_string(), "invalid max_attempts: must be at least 1");
    }
}
