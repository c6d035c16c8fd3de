use std::fmt;

use serde::Serialize;

use crate::rpc::Status;

/// Lifecycle of a single call. Every state but `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Active,
    Completed,
    Aborted,
    Cancelled,
    DeadlineExceeded,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        self != Self::Active
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline exceeded",
        };
        f.write_str(name)
    }
}

/// Streaming shape of a method: whether requests and responses are single or streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallShape {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl CallShape {
    /// The handler receives exactly one request, read by the runtime.
    pub fn single_request(self) -> bool {
        matches!(self, Self::Unary | Self::ServerStreaming)
    }

    /// The handler's return value is the one and only response.
    pub fn single_response(self) -> bool {
        matches!(self, Self::Unary | Self::ClientStreaming)
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::BidiStreaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

/// What completion callbacks observe: the terminal state and the status the client saw.
///
/// `status` is `None` when the client went away before a status could be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub state: CallState,
    pub status: Option<Status>,
}
