//! Minimal client speaking the server's framing
//!
//! One [`Channel`] multiplexes any number of [`ClientCall`]s over a single connection.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::debug;

use crate::rpc::{Metadata, Status};
use crate::server::ServerOptions;
use crate::transport::{
    credentials::BoxedIo,
    frame::{CallHeader, Frame, FrameCodec},
};

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Disconnected,
    #[error("call failed with {0}")]
    Status(Status),
    #[error("call completed without a response message")]
    MissingResponse,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub metadata: Metadata,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug)]
enum CallEvent {
    Headers(Metadata),
    Message(Bytes),
    Status(Status),
}

type CallRoutes = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<CallEvent>>>>;

/// A client connection.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::Sender<Frame>,
    routes: CallRoutes,
    next_stream: AtomicU32,
    closed: CancellationToken,
}

impl Channel {
    pub async fn connect(address: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self::connect_with(Box::new(stream)))
    }

    /// Runs the protocol over an already established (and possibly secured) stream.
    pub fn connect_with(io: BoxedIo) -> Self {
        let limit = ServerOptions::default().max_message_bytes;
        let (reader, writer) = tokio::io::split(io);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let routes = CallRoutes::default();
        let closed = CancellationToken::new();

        tokio::spawn(write_frames(
            FramedWrite::new(writer, FrameCodec::new(limit)),
            outbound_rx,
            closed.clone(),
        ));
        tokio::spawn(read_frames(
            FramedRead::new(reader, FrameCodec::new(limit)),
            routes.clone(),
            closed.clone(),
        ));

        Self {
            outbound,
            routes,
            next_stream: AtomicU32::new(1),
            closed,
        }
    }

    /// Opens a call to `method`, e.g. `/demo.Echo/Echo`.
    pub async fn start_call(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<ClientCall, ClientError> {
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events) = mpsc::unbounded_channel();
        self.routes.lock().insert(stream, events_tx);

        let header = CallHeader {
            method: method.to_string(),
            metadata: options.metadata,
            timeout_ms: options
                .timeout
                .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        };
        if self
            .outbound
            .send(Frame::Start { stream, header })
            .await
            .is_err()
        {
            self.routes.lock().remove(&stream);
            return Err(ClientError::Disconnected);
        }

        Ok(ClientCall {
            stream,
            outbound: self.outbound.clone(),
            events,
            initial_metadata: None,
            status: None,
        })
    }

    /// Sends one request and waits for the single response.
    pub async fn unary(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        options: CallOptions,
    ) -> Result<Bytes, ClientError> {
        let mut call = self.start_call(method, options).await?;
        call.send(request.into()).await?;
        call.half_close().await?;

        let response = call.message().await?;
        let status = call.status().await?;
        if !status.is_ok() {
            return Err(ClientError::Status(status));
        }
        response.ok_or(ClientError::MissingResponse)
    }

    /// Drops the connection; the server sees every open call as cancelled.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// One call opened on a [`Channel`].
#[derive(Debug)]
pub struct ClientCall {
    stream: u32,
    outbound: mpsc::Sender<Frame>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    initial_metadata: Option<Metadata>,
    status: Option<Status>,
}

impl ClientCall {
    pub async fn send(&self, message: impl Into<Bytes>) -> Result<(), ClientError> {
        self.send_frame(Frame::Message {
            stream: self.stream,
            payload: message.into(),
        })
        .await
    }

    pub async fn half_close(&self) -> Result<(), ClientError> {
        self.send_frame(Frame::HalfClose {
            stream: self.stream,
        })
        .await
    }

    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.send_frame(Frame::Cancel {
            stream: self.stream,
        })
        .await
    }

    /// Next response message, or `None` once the server sent its status.
    pub async fn message(&mut self) -> Result<Option<Bytes>, ClientError> {
        if self.status.is_some() {
            return Ok(None);
        }
        loop {
            match self.events.recv().await {
                Some(CallEvent::Headers(metadata)) => self.initial_metadata = Some(metadata),
                Some(CallEvent::Message(message)) => return Ok(Some(message)),
                Some(CallEvent::Status(status)) => {
                    self.status = Some(status);
                    return Ok(None);
                }
                None => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Waits for the terminal status, discarding any unread messages.
    pub async fn status(&mut self) -> Result<Status, ClientError> {
        while self.message().await?.is_some() {}
        self.status.clone().ok_or(ClientError::Disconnected)
    }

    /// Initial metadata, once the server has sent it.
    pub fn initial_metadata(&self) -> Option<&Metadata> {
        self.initial_metadata.as_ref()
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::Disconnected)
    }
}

async fn read_frames<R>(
    mut frames: FramedRead<R, FrameCodec>,
    routes: CallRoutes,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(error = %err, "client read failed");
                break;
            }
            None => break,
        };

        let stream = frame.stream();
        let event = match frame {
            Frame::Headers { metadata, .. } => CallEvent::Headers(metadata),
            Frame::Message { payload, .. } => CallEvent::Message(payload),
            Frame::Status { status, .. } => CallEvent::Status(status),
            other => {
                debug!(stream, frame = ?other, "ignoring client-only frame from server");
                continue;
            }
        };
        let terminal = matches!(event, CallEvent::Status(_));
        let mut open = routes.lock();
        if let Some(route) = open.get(&stream) {
            let _ = route.send(event);
        }
        if terminal {
            open.remove(&stream);
        }
    }
    // Pending calls observe the disconnect.
    routes.lock().clear();
    closed.cancel();
}

async fn write_frames<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(err) = sink.send(frame).await {
            debug!(error = %err, "client write failed");
            break;
        }
    }
    let _ = sink.close().await;
}
