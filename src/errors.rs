use axum::{
    http::StatusCode as HttpStatus,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::call::{CallShape, CallState};
use crate::rpc::{MetadataError, Status};
use crate::server::ServerState;

/// Lifecycle errors, surfaced synchronously to the caller of the violated operation.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{operation} is not allowed while the server is {state}")]
    InvalidState {
        operation: &'static str,
        state: ServerState,
    },
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    pub fn invalid_state(operation: &'static str, state: ServerState) -> Self {
        Self::InvalidState { operation, state }
    }

    pub fn bind(address: impl Into<String>, source: std::io::Error) -> Self {
        Self::Bind {
            address: address.into(),
            source,
        }
    }
}

/// Stream-level errors. Local to one call; never affect other calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("call is no longer active ({0})")]
    Inactive(CallState),
    #[error("another read is already outstanding on this call")]
    ConcurrentRead,
    #[error("another write is already outstanding on this call")]
    ConcurrentWrite,
    #[error("initial metadata has already been sent")]
    InitialMetadataAlreadySent,
    #[error("{0} calls respond with the handler's return value, write is not permitted")]
    WriteNotAllowed(CallShape),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

/// Produced only by [`crate::call::CallContext::abort`]. The call is already
/// terminal by the time a handler holds one; it should be returned, not handled.
#[derive(Debug, Error)]
#[error("call aborted with {status}")]
#[must_use = "return the abort signal from the handler"]
pub struct AbortSignal {
    status: Status,
}

impl AbortSignal {
    pub(crate) fn new(status: Status) -> Self {
        Self { status }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }
}

/// Failure returned by a handler future.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Aborted(#[from] AbortSignal),
    #[error(transparent)]
    Stream(#[from] RpcError),
    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(anyhow::anyhow!(message.into()))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fault(err.into())
    }
}

/// Errors rendered by the admin HTTP surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthorized { code, message } => {
                (HttpStatus::UNAUTHORIZED, code, message.to_string())
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}
