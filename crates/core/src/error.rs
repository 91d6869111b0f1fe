//! Error surface of the store.
//!
//! Every failure carries a [`Status`] class and a human readable message. The
//! transport layer maps the class to its own response codes (see
//! [`Status::http_code`]); nothing below the gateway knows about HTTP.

use serde::{Deserialize, Serialize};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Malformed identity or payload.
    BadRequest,
    /// Create on an existing key, or a revision mismatch.
    Conflict,
    /// The operation targets a key with no record.
    NotFound,
    /// Substrate I/O, encode/decode or validation hook failure.
    Internal,
    /// The caller's context was cancelled or its deadline passed.
    Cancelled,
}

impl Status {
    pub fn http_code(self) -> u16 {
        match self {
            Status::BadRequest => 400,
            Status::Conflict => 409,
            Status::NotFound => 404,
            Status::Internal => 500,
            // Client closed request, as used by nginx.
            Status::Cancelled => 499,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::BadRequest => "bad_request",
            Status::Conflict => "conflict",
            Status::NotFound => "not_found",
            Status::Internal => "internal",
            Status::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HzError {
    pub status: Status,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

pub type HzResult<T> = Result<T, HzError>;

impl HzError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self { status, message: message.into(), source: None }
    }

    pub fn bad_request(message: impl Into<String>) -> Self { Self::new(Status::BadRequest, message) }
    pub fn conflict(message: impl Into<String>) -> Self { Self::new(Status::Conflict, message) }
    pub fn not_found(message: impl Into<String>) -> Self { Self::new(Status::NotFound, message) }
    pub fn internal(message: impl Into<String>) -> Self { Self::new(Status::Internal, message) }
    pub fn cancelled(message: impl Into<String>) -> Self { Self::new(Status::Cancelled, message) }

    /// Wrap `err` under `status`, prefixing its message with `context`.
    /// The wrapped error stays reachable through `source()`.
    pub fn wrap<E>(err: E, status: Status, context: impl std::fmt::Display) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { status, message: format!("{}: {}", context, err), source: Some(Box::new(err)) }
    }

    pub fn status(&self) -> Status { self.status }
    pub fn is_conflict(&self) -> bool { self.status == Status::Conflict }
    pub fn is_not_found(&self) -> bool { self.status == Status::NotFound }
    pub fn is_cancelled(&self) -> bool { self.status == Status::Cancelled }
}
