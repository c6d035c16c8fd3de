//! `demo.Echo`, the service the binary serves
//!
//! One method per call shape plus `Deny`, which always aborts.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::call::CallContext;
use crate::errors::HandlerError;
use crate::handler::ServiceHandlers;
use crate::rpc::{Metadata, StatusCode};

pub const SERVICE: &str = "demo.Echo";

const MAX_REPEAT: u32 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatRequest {
    pub message: String,
    pub count: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectResponse {
    pub messages: usize,
    pub bytes: usize,
}

pub fn service() -> ServiceHandlers {
    ServiceHandlers::new(SERVICE)
        .unary("Echo", echo)
        .server_streaming("Repeat", repeat)
        .client_streaming("Collect", collect)
        .bidi_streaming("Chat", chat)
        .unary("Deny", deny)
}

async fn echo(request: Bytes, ctx: CallContext) -> Result<Bytes, HandlerError> {
    let mut trailers = Metadata::new();
    trailers.insert("x-echo-peer", ctx.peer());
    ctx.set_trailing_metadata(trailers)?;
    Ok(request)
}

async fn repeat(request: Bytes, ctx: CallContext) -> Result<(), HandlerError> {
    let request: RepeatRequest = serde_json::from_slice(&request)?;
    if request.count > MAX_REPEAT {
        return Err(ctx
            .abort(
                StatusCode::InvalidArgument,
                format!("count must be at most {MAX_REPEAT}"),
            )
            .await
            .into());
    }

    let message = Bytes::from(request.message);
    for index in 0..request.count {
        if index > 0 && request.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(request.interval_ms)).await;
        }
        ctx.write(message.clone()).await?;
    }
    Ok(())
}

async fn collect(ctx: CallContext) -> Result<Bytes, HandlerError> {
    let mut response = CollectResponse {
        messages: 0,
        bytes: 0,
    };
    while let Some(message) = ctx.read().await? {
        response.messages += 1;
        response.bytes += message.len();
    }
    Ok(serde_json::to_vec(&response)?.into())
}

async fn chat(ctx: CallContext) -> Result<(), HandlerError> {
    let mut headers = Metadata::new();
    headers.insert("x-chat", "ready");
    ctx.send_initial_metadata(headers).await?;

    while let Some(message) = ctx.read().await? {
        let mut reply = BytesMut::with_capacity(message.len() + 6);
        reply.put_slice(b"echo: ");
        reply.put_slice(&message);
        ctx.write(reply.freeze()).await?;
    }
    Ok(())
}

async fn deny(_request: Bytes, ctx: CallContext) -> Result<Bytes, HandlerError> {
    Err(ctx
        .abort(StatusCode::PermissionDenied, "no access")
        .await
        .into())
}
