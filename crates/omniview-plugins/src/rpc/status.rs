//! Status codes carried by failed responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// The caller cancelled the call.
    Cancelled,
    /// The request payload is malformed.
    InvalidArgument,
    /// A named entity does not exist.
    NotFound,
    /// The entity being created already exists.
    AlreadyExists,
    /// The system is not in a state where the call can run.
    FailedPrecondition,
    /// The caller lacks valid credentials.
    Unauthenticated,
    /// A buffer or quota ran out.
    ResourceExhausted,
    /// The call did not finish before its deadline.
    DeadlineExceeded,
    /// The method is not implemented by the service.
    Unimplemented,
    /// The service is not reachable.
    Unavailable,
    /// An invariant broke inside the service.
    Internal,
}

impl StatusCode {
    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::FailedPrecondition => "failed_precondition",
            Self::Unauthenticated => "unauthenticated",
            Self::ResourceExhausted => "resource_exhausted",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unimplemented => "unimplemented",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call outcome: a code and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    /// Failure class.
    pub code: StatusCode,
    /// Description for logs and users.
    pub message: String,
}

impl RpcStatus {
    /// Builds a status.
    #[must_use]
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `internal`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    /// `not_found`.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    /// `invalid_argument`.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// `failed_precondition`.
    #[must_use]
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    /// `unimplemented`.
    #[must_use]
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    /// `unavailable`.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// `resource_exhausted`.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }

    /// The status returned by resource- or connection-scoped methods invoked
    /// without a plugin context.
    #[must_use]
    pub fn no_plugin_context() -> Self {
        Self::failed_precondition("no plugin context")
    }

    /// Whether a caller may retry the call unchanged.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            StatusCode::Unavailable | StatusCode::DeadlineExceeded
        )
    }
}
