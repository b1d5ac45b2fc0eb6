//! Wire protocol types for host-plugin communication.
//!
//! A single session socket carries both directions:
//! - **Requests** (host to plugin): Call, Cancel, Shutdown
//! - **Responses** (plugin to host): Result, Error, ShuttingDown
//!
//! Every call-scoped frame carries the call id, so responses to concurrent
//! calls may arrive in any order.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Host-assigned identifier for one call. Echoed on the matching response.
pub type CallId = u64;

/// One request unit naming a capability, a method and a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: CallId,
    pub capability: String,
    pub method: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-call deadline relative to receipt. Absent means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl CallEnvelope {
    pub fn new(
        id: CallId,
        capability: impl Into<String>,
        method: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            capability: capability.into(),
            method: method.into(),
            payload,
            deadline_ms: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// Messages from host to plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Call(CallEnvelope),

    /// Cancel one in-flight call. Ignored if the call already finished.
    Cancel { id: CallId },

    /// Stop serving: finish in-flight calls, then close the session.
    Shutdown,
}

/// Messages from plugin to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Result {
        id: CallId,
        payload: serde_json::Value,
    },

    Error {
        id: CallId,
        kind: ErrorKind,
        message: String,
    },

    /// Acknowledges a Shutdown request. No further calls are read.
    ShuttingDown,
}

impl Response {
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Result { id, .. } | Self::Error { id, .. } => Some(*id),
            Self::ShuttingDown => None,
        }
    }
}

/// Classification carried on every error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownCapability,
    UnknownMethod,
    /// The frame or the payload could not be decoded.
    InvalidRequest,
    /// The capability method itself failed.
    Execution,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCapability => "unknown_capability",
            Self::UnknownMethod => "unknown_method",
            Self::InvalidRequest => "invalid_request",
            Self::Execution => "execution",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
