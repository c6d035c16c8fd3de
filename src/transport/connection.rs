use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWrite,
    net::{TcpListener, TcpStream},
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::credentials::{AuthContext, BoxedIo, ServerCredentials};
use super::frame::{Frame, FrameCodec};
use crate::call::{CallContext, CallState, Inbound, Peer};
use crate::rpc::{Status, StatusCode};
use crate::server::{AcceptedCall, ServerInner};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts connections on `listener` until the server stops accepting.
pub(crate) async fn accept_loop(
    server: Arc<ServerInner>,
    listener: TcpListener,
    credentials: Option<Arc<dyn ServerCredentials>>,
) {
    let local = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            _ = server.accepting().cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                tokio::spawn(serve_connection(
                    server.clone(),
                    stream,
                    remote,
                    credentials.clone(),
                ));
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!(local = ?local, "listener closed");
}

async fn serve_connection(
    server: Arc<ServerInner>,
    stream: TcpStream,
    remote: SocketAddr,
    credentials: Option<Arc<dyn ServerCredentials>>,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%remote, error = %err, "failed to set TCP_NODELAY");
    }

    let (io, auth): (BoxedIo, AuthContext) = match credentials {
        Some(credentials) => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, credentials.handshake(stream)).await {
                Ok(Ok(secured)) => secured,
                Ok(Err(err)) => {
                    warn!(%remote, error = %err, "transport handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(%remote, "transport handshake timed out");
                    return;
                }
            }
        }
        None => (Box::new(stream), AuthContext::default()),
    };

    let peer = Peer::from_socket_addr(remote, auth);
    debug!(peer = peer.address(), "connection established");
    Connection {
        server,
        peer,
        calls: HashMap::new(),
    }
    .run(io)
    .await;
}

/// One client connection, multiplexing calls by stream id.
struct Connection {
    server: Arc<ServerInner>,
    peer: Peer,
    calls: HashMap<u32, AcceptedCall>,
}

impl Connection {
    async fn run(mut self, io: BoxedIo) {
        let limit = self.server.options().max_message_bytes;
        let (reader, writer) = tokio::io::split(io);
        let mut frames = FramedRead::new(reader, FrameCodec::new(limit));
        let (outbound, outbound_rx) = mpsc::channel(self.server.options().outbound_buffer);
        tokio::spawn(write_frames(
            FramedWrite::new(writer, FrameCodec::new(limit)),
            outbound_rx,
        ));
        let (finished_tx, mut finished) = mpsc::unbounded_channel();
        let stopped = self.server.stopped_token();

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame, &outbound, &finished_tx).await,
                    Some(Err(err)) => {
                        warn!(peer = self.peer.address(), error = %err, "closing connection after bad frame");
                        break;
                    }
                    None => break,
                },
                Some(stream) = finished.recv() => {
                    self.calls.remove(&stream);
                }
                _ = stopped.cancelled() => break,
            }
        }

        for (_, call) in self.calls.drain() {
            call.ctx.terminate(CallState::Cancelled, None).await;
        }
        debug!(peer = self.peer.address(), "connection closed");
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        outbound: &mpsc::Sender<Frame>,
        finished: &mpsc::UnboundedSender<u32>,
    ) {
        match frame {
            Frame::Start { stream, header } => {
                if self.calls.contains_key(&stream) {
                    warn!(stream, "ignoring start for a stream that is already open");
                    return;
                }
                let accepted = self
                    .server
                    .accept_call(
                        stream,
                        header,
                        self.peer.clone(),
                        outbound.clone(),
                        finished.clone(),
                    )
                    .await;
                if let Some(call) = accepted {
                    self.calls.insert(stream, call);
                }
            }
            Frame::Message { stream, payload } => {
                let limit = self.server.options().max_message_bytes;
                if payload.len() > limit {
                    if let Some(call) = self.calls.get(&stream) {
                        warn!(
                            stream,
                            size = payload.len(),
                            limit,
                            "client sent an oversized message"
                        );
                        exhaust(
                            &call.ctx,
                            format!(
                                "Received message larger than max ({} vs. {limit})",
                                payload.len()
                            ),
                        );
                    }
                    return;
                }
                self.route(stream, Inbound::Message(payload));
            }
            Frame::HalfClose { stream } => self.route(stream, Inbound::HalfClose),
            Frame::Cancel { stream } => {
                if let Some(call) = self.calls.get(&stream) {
                    call.ctx.terminate(CallState::Cancelled, None).await;
                }
            }
            Frame::Headers { stream, .. } | Frame::Status { stream, .. } => {
                warn!(stream, "client sent a server-only frame");
            }
        }
    }

    /// Hands `event` to its call without ever waiting on that call's handler.
    fn route(&self, stream: u32, event: Inbound) {
        // Frames for calls that already ended are dropped.
        let Some(call) = self.calls.get(&stream) else {
            return;
        };
        if call.ctx.state().is_terminal() {
            return;
        }
        match call.inbound.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(Inbound::HalfClose)) => {
                // At most one per call, delivered once the handler catches up.
                let ctx = call.ctx.clone();
                let inbound = call.inbound.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = ctx.terminated() => {}
                        _ = inbound.send(Inbound::HalfClose) => {}
                    }
                });
            }
            Err(TrySendError::Full(Inbound::Message(_))) => {
                warn!(stream, "call is not reading its requests, failing it");
                exhaust(&call.ctx, "Too many unread request messages".to_string());
            }
        }
    }
}

/// Fails one call with RESOURCE_EXHAUSTED. The call ends before this returns; only the
/// status frame is sent off the connection's read path.
fn exhaust(ctx: &CallContext, details: String) {
    let status = Status::new(StatusCode::ResourceExhausted, details);
    if ctx.end(CallState::Aborted, Some(status.clone())) {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.send_status(status).await });
    }
}

async fn write_frames<W>(mut sink: FramedWrite<W, FrameCodec>, mut frames: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(err) = sink.send(frame).await {
            debug!(error = %err, "connection write failed");
            return;
        }
    }
    if let Err(err) = sink.close().await {
        debug!(error = %err, "failed to close connection");
    }
}
