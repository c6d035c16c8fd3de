//! Length-delimited wire frames
//!
//! Each frame is `[kind: u8][stream: u32 BE][payload]` inside a length-delimited envelope.
//! Message payloads are opaque bytes; call headers, metadata and statuses are JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::rpc::{Metadata, Status};

const HEADER_LEN: usize = 5;
/// Room for the frame header and JSON-encoded metadata on top of the message limit.
const FRAME_OVERHEAD: usize = 64 * 1024;

const KIND_START: u8 = 0x01;
const KIND_MESSAGE: u8 = 0x02;
const KIND_HALF_CLOSE: u8 = 0x03;
const KIND_CANCEL: u8 = 0x04;
const KIND_HEADERS: u8 = 0x11;
const KIND_STATUS: u8 = 0x13;

/// What a client sends to open a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallHeader {
    pub method: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client opens a call on `stream`.
    Start { stream: u32, header: CallHeader },
    /// Request or response message, depending on direction.
    Message { stream: u32, payload: Bytes },
    /// Client will send no more messages.
    HalfClose { stream: u32 },
    /// Client abandons the call.
    Cancel { stream: u32 },
    /// Server's initial metadata.
    Headers { stream: u32, metadata: Metadata },
    /// Server's terminal status; the last frame of a call.
    Status { stream: u32, status: Status },
}

impl Frame {
    pub fn stream(&self) -> u32 {
        match self {
            Self::Start { stream, .. }
            | Self::Message { stream, .. }
            | Self::HalfClose { stream }
            | Self::Cancel { stream }
            | Self::Headers { stream, .. }
            | Self::Status { stream, .. } => *stream,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame shorter than its {HEADER_LEN} byte header")]
    Truncated,
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct FrameCodec {
    envelope: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            envelope: LengthDelimitedCodec::builder()
                .max_frame_length(max_message_bytes.saturating_add(FRAME_OVERHEAD))
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(mut body) = self.envelope.decode(src)? else {
            return Ok(None);
        };
        if body.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }

        let kind = body.get_u8();
        let stream = body.get_u32();
        let payload = body.freeze();

        let frame = match kind {
            KIND_START => Frame::Start {
                stream,
                header: serde_json::from_slice(&payload)?,
            },
            KIND_MESSAGE => Frame::Message { stream, payload },
            KIND_HALF_CLOSE => Frame::HalfClose { stream },
            KIND_CANCEL => Frame::Cancel { stream },
            KIND_HEADERS => Frame::Headers {
                stream,
                metadata: serde_json::from_slice(&payload)?,
            },
            KIND_STATUS => Frame::Status {
                stream,
                status: serde_json::from_slice(&payload)?,
            },
            other => return Err(FrameError::UnknownKind(other)),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let stream = frame.stream();
        let (kind, payload) = match frame {
            Frame::Start { header, .. } => (KIND_START, Bytes::from(serde_json::to_vec(&header)?)),
            Frame::Message { payload, .. } => (KIND_MESSAGE, payload),
            Frame::HalfClose { .. } => (KIND_HALF_CLOSE, Bytes::new()),
            Frame::Cancel { .. } => (KIND_CANCEL, Bytes::new()),
            Frame::Headers { metadata, .. } => {
                (KIND_HEADERS, Bytes::from(serde_json::to_vec(&metadata)?))
            }
            Frame::Status { status, .. } => (KIND_STATUS, Bytes::from(serde_json::to_vec(&status)?)),
        };

        let mut body = BytesMut::with_capacity(HEADER_LEN + payload.len());
        body.put_u8(kind);
        body.put_u32(stream);
        body.put_slice(&payload);
        self.envelope.encode(body.freeze(), dst)?;
        Ok(())
    }
}
