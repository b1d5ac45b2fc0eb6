//! Per-call execution context and error type.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{CallId, ErrorKind, Response};

/// Context handed to every capability method invocation.
///
/// The cancellation token fires when the host cancels this call or when the
/// plugin starts shutting down. Methods that wait on external I/O should race
/// against [`CallContext::cancelled`].
#[derive(Debug, Clone)]
pub struct CallContext {
    id: CallId,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(id: CallId, cancel: CancellationToken) -> Self {
        Self {
            id,
            deadline: None,
            cancel,
        }
    }

    /// Deadline relative to now. `None` leaves the call unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn call_id(&self) -> CallId {
        self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Failure of a single call. Always reported to the host as an error response;
/// never ends the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The capability method failed; `message` is passed to the host verbatim.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "call was cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "call deadline exceeded")
    }

    pub fn into_response(self, id: CallId) -> Response {
        Response::Error {
            id,
            kind: self.kind,
            message: self.message,
        }
    }
}
