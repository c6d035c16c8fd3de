use std::{
    fmt,
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    time::Instant,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, warn};

use super::state::{CallOutcome, CallShape, CallState};
use crate::errors::{AbortSignal, RpcError};
use crate::rpc::{Metadata, Status, StatusCode};
use crate::transport::{credentials::AuthContext, frame::Frame};

pub type CallId = u64;

/// Upper bound on how long a terminal status may wait for room in the connection's send queue.
const STATUS_SEND_TIMEOUT: Duration = Duration::from_secs(5);

type CompletionCallback = Box<dyn FnOnce(&CallOutcome) + Send>;

/// Inbound events routed from the connection to one call.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Bytes),
    HalfClose,
}

/// Remote end of a call: its address and whatever the transport authenticated.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    address: String,
    auth: AuthContext,
}

impl Peer {
    pub fn new(address: impl Into<String>, auth: AuthContext) -> Self {
        Self {
            address: address.into(),
            auth,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, auth: AuthContext) -> Self {
        let address = match addr {
            SocketAddr::V4(addr) => format!("ipv4:{addr}"),
            SocketAddr::V6(addr) => format!("ipv6:{addr}"),
        };
        Self::new(address, auth)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }
}

pub(crate) struct CallParts {
    pub id: CallId,
    pub stream: u32,
    pub method: String,
    pub shape: CallShape,
    pub invocation_metadata: Metadata,
    pub peer: Peer,
    pub deadline: Option<Instant>,
    pub max_message_bytes: usize,
    pub inbound: mpsc::Receiver<Inbound>,
    pub outbound: mpsc::Sender<Frame>,
}

struct InboundStream {
    messages: mpsc::Receiver<Inbound>,
    finished: bool,
}

struct CallFields {
    state: CallState,
    code: StatusCode,
    details: String,
    trailing_metadata: Metadata,
    initial_metadata_sent: bool,
    status: Option<Status>,
}

#[derive(Default)]
struct Completion {
    callbacks: Vec<CompletionCallback>,
    outcome: Option<CallOutcome>,
}

struct CallInner {
    id: CallId,
    stream: u32,
    method: String,
    shape: CallShape,
    invocation_metadata: Metadata,
    peer: Peer,
    deadline: Option<Instant>,
    max_message_bytes: usize,
    fields: Mutex<CallFields>,
    // Held for the duration of a read; a second reader fails `try_lock`.
    inbound: AsyncMutex<InboundStream>,
    // Same discipline for writes, initial metadata and the terminal status.
    writer: AsyncMutex<()>,
    outbound: mpsc::Sender<Frame>,
    terminated: CancellationToken,
    completion: Mutex<Completion>,
}

/// Handle through which a handler services one call.
///
/// Cloning is cheap and every clone refers to the same call. At most one `read` and one
/// `write` may be in flight at a time; a second concurrent attempt fails instead of queuing.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<CallInner>,
}

impl CallContext {
    pub(crate) fn new(parts: CallParts) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id: parts.id,
                stream: parts.stream,
                method: parts.method,
                shape: parts.shape,
                invocation_metadata: parts.invocation_metadata,
                peer: parts.peer,
                deadline: parts.deadline,
                max_message_bytes: parts.max_message_bytes,
                fields: Mutex::new(CallFields {
                    state: CallState::Active,
                    code: StatusCode::Ok,
                    details: String::new(),
                    trailing_metadata: Metadata::new(),
                    initial_metadata_sent: false,
                    status: None,
                }),
                inbound: AsyncMutex::new(InboundStream {
                    messages: parts.inbound,
                    finished: false,
                }),
                writer: AsyncMutex::new(()),
                outbound: parts.outbound,
                terminated: CancellationToken::new(),
                completion: Mutex::new(Completion::default()),
            }),
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id
    }

    pub(crate) fn stream(&self) -> u32 {
        self.inner.stream
    }

    /// Fully qualified method name, e.g. `/demo.Echo/Echo`.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn shape(&self) -> CallShape {
        self.inner.shape
    }

    /// Metadata the client sent when it started the call.
    pub fn invocation_metadata(&self) -> &Metadata {
        &self.inner.invocation_metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn state(&self) -> CallState {
        self.inner.fields.lock().state
    }

    /// Whether reads, writes and metadata changes are still accepted.
    pub fn is_active(&self) -> bool {
        self.check_active().is_ok()
    }

    /// Time left before the deadline, `None` if the call has no deadline.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Reads the next request message.
    ///
    /// Returns `Ok(None)` once the client has half-closed its side.
    pub async fn read(&self) -> Result<Option<Bytes>, RpcError> {
        let mut inbound = self
            .inner
            .inbound
            .try_lock()
            .map_err(|_| RpcError::ConcurrentRead)?;
        self.check_active()?;
        if inbound.finished {
            return Ok(None);
        }

        let next = tokio::select! {
            biased;
            _ = self.inner.terminated.cancelled() => return Err(self.inactive()),
            next = inbound.messages.recv() => next,
        };

        match next {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::HalfClose) => {
                inbound.finished = true;
                Ok(None)
            }
            None => Err(RpcError::Inactive(CallState::Cancelled)),
        }
    }

    /// Writes one response message, sending empty initial metadata first if none was sent.
    ///
    /// Only streaming-response calls may write; single-response handlers return their reply.
    pub async fn write(&self, message: Bytes) -> Result<(), RpcError> {
        if self.inner.shape.single_response() {
            return Err(RpcError::WriteNotAllowed(self.inner.shape));
        }
        self.write_message(message).await
    }

    pub(crate) async fn write_message(&self, message: Bytes) -> Result<(), RpcError> {
        let _writer = self
            .inner
            .writer
            .try_lock()
            .map_err(|_| RpcError::ConcurrentWrite)?;
        self.check_active()?;
        if message.len() > self.inner.max_message_bytes {
            return Err(RpcError::MessageTooLarge {
                size: message.len(),
                limit: self.inner.max_message_bytes,
            });
        }

        let headers_pending = {
            let mut fields = self.inner.fields.lock();
            !std::mem::replace(&mut fields.initial_metadata_sent, true)
        };
        if headers_pending {
            self.send_frame(Frame::Headers {
                stream: self.inner.stream,
                metadata: Metadata::new(),
            })
            .await?;
        }

        self.send_frame(Frame::Message {
            stream: self.inner.stream,
            payload: message,
        })
        .await
    }

    /// Sends initial metadata. Must precede the first write and may happen only once.
    pub async fn send_initial_metadata(&self, metadata: Metadata) -> Result<(), RpcError> {
        let _writer = self
            .inner
            .writer
            .try_lock()
            .map_err(|_| RpcError::ConcurrentWrite)?;
        self.check_active()?;
        metadata.validate()?;
        {
            let mut fields = self.inner.fields.lock();
            if fields.initial_metadata_sent {
                return Err(RpcError::InitialMetadataAlreadySent);
            }
            fields.initial_metadata_sent = true;
        }

        self.send_frame(Frame::Headers {
            stream: self.inner.stream,
            metadata,
        })
        .await
    }

    /// Terminates the call with a non-OK status and returns the signal the handler must return.
    ///
    /// Takes effect immediately: pending and later stream operations fail, and any code,
    /// details or trailing metadata set earlier are discarded.
    pub async fn abort(&self, code: StatusCode, details: impl Into<String>) -> AbortSignal {
        self.abort_with_trailers(code, details, Metadata::new())
            .await
    }

    pub async fn abort_with_trailers(
        &self,
        code: StatusCode,
        details: impl Into<String>,
        trailing_metadata: Metadata,
    ) -> AbortSignal {
        let code = if code.is_ok() {
            warn!(call_id = self.inner.id, "abort called with OK, sending UNKNOWN instead");
            StatusCode::Unknown
        } else {
            code
        };
        let trailing_metadata = match trailing_metadata.validate() {
            Ok(()) => trailing_metadata,
            Err(err) => {
                warn!(call_id = self.inner.id, error = %err, "dropping invalid abort trailers");
                Metadata::new()
            }
        };

        let status = Status::new(code, details).with_trailing_metadata(trailing_metadata);
        if !self
            .terminate(CallState::Aborted, Some(status.clone()))
            .await
        {
            debug!(call_id = self.inner.id, "abort on a call that already ended");
        }
        AbortSignal::new(status)
    }

    /// Status code to send if the handler returns normally. Ignored once the call has ended.
    pub fn set_code(&self, code: StatusCode) {
        let mut fields = self.inner.fields.lock();
        if !fields.state.is_terminal() {
            fields.code = code;
        }
    }

    pub fn set_details(&self, details: impl Into<String>) {
        let mut fields = self.inner.fields.lock();
        if !fields.state.is_terminal() {
            fields.details = details.into();
        }
    }

    pub fn set_trailing_metadata(&self, metadata: Metadata) -> Result<(), RpcError> {
        metadata.validate()?;
        let mut fields = self.inner.fields.lock();
        if !fields.state.is_terminal() {
            fields.trailing_metadata = metadata;
        }
        Ok(())
    }

    pub fn code(&self) -> StatusCode {
        self.inner.fields.lock().code
    }

    pub fn details(&self) -> String {
        self.inner.fields.lock().details.clone()
    }

    pub fn trailing_metadata(&self) -> Metadata {
        self.inner.fields.lock().trailing_metadata.clone()
    }

    /// Address of the client, e.g. `ipv4:127.0.0.1:50312`.
    pub fn peer(&self) -> &str {
        self.inner.peer.address()
    }

    pub fn peer_identities(&self) -> Option<Vec<Bytes>> {
        self.inner.peer.auth().peer_identities().map(<[Bytes]>::to_vec)
    }

    pub fn peer_identity_key(&self) -> Option<&str> {
        self.inner.peer.auth().peer_identity_key()
    }

    pub fn auth_context(&self) -> &AuthContext {
        self.inner.peer.auth()
    }

    /// Registers `callback` to run once the call has fully ended, whatever the cause.
    ///
    /// Registering after the call ended runs the callback immediately.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&CallOutcome) + Send + 'static,
    {
        let mut completion = self.inner.completion.lock();
        match completion.outcome.clone() {
            Some(outcome) => {
                drop(completion);
                run_callback(self.inner.id, Box::new(callback), &outcome);
            }
            None => completion.callbacks.push(Box::new(callback)),
        }
    }

    /// Moves the call into `state` unless it already ended. Returns whether this call did it.
    ///
    /// Unblocks any pending read or write, then transmits `status` if one is given.
    pub(crate) async fn terminate(&self, state: CallState, status: Option<Status>) -> bool {
        if !self.end(state, status.clone()) {
            return false;
        }
        if let Some(status) = status {
            self.send_status(status).await;
        }
        true
    }

    /// The synchronous half of [`terminate`](Self::terminate): records the terminal state
    /// and wakes pending operations, leaving `status` for [`send_status`](Self::send_status).
    pub(crate) fn end(&self, state: CallState, status: Option<Status>) -> bool {
        {
            let mut fields = self.inner.fields.lock();
            if fields.state.is_terminal() {
                return false;
            }
            fields.state = state;
            fields.status = status;
        }
        self.inner.terminated.cancel();
        true
    }

    pub(crate) async fn send_status(&self, status: Status) {
        let _writer = self.inner.writer.lock().await;
        let frame = Frame::Status {
            stream: self.inner.stream,
            status,
        };
        match tokio::time::timeout(STATUS_SEND_TIMEOUT, self.inner.outbound.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(call_id = self.inner.id, "connection closed before status"),
            Err(_) => warn!(call_id = self.inner.id, "timed out queueing terminal status"),
        }
    }

    /// Settles the call once its handler is gone and fires the completion callbacks.
    pub(crate) async fn finish(&self) -> CallOutcome {
        if !self.state().is_terminal() {
            let status = self.pending_status();
            self.terminate(CallState::Completed, Some(status)).await;
        }

        {
            // Wait out reads and writes still unwinding from the terminal transition.
            let _inbound = self.inner.inbound.lock().await;
            let _writer = self.inner.writer.lock().await;
        }

        let outcome = {
            let fields = self.inner.fields.lock();
            CallOutcome {
                state: fields.state,
                status: fields.status.clone(),
            }
        };
        let callbacks = {
            let mut completion = self.inner.completion.lock();
            if completion.outcome.is_some() {
                return outcome;
            }
            completion.outcome = Some(outcome.clone());
            std::mem::take(&mut completion.callbacks)
        };
        for callback in callbacks {
            run_callback(self.inner.id, callback, &outcome);
        }
        outcome
    }

    /// Status assembled from what the handler set so far.
    pub(crate) fn pending_status(&self) -> Status {
        let fields = self.inner.fields.lock();
        Status {
            code: fields.code,
            details: fields.details.clone(),
            trailing_metadata: fields.trailing_metadata.clone(),
        }
    }

    pub(crate) fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.inner.terminated.cancelled()
    }

    pub(crate) fn same_call(&self, other: &CallContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_active(&self) -> Result<(), RpcError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(RpcError::Inactive(state));
        }
        let expired = self
            .inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            return Err(RpcError::Inactive(CallState::DeadlineExceeded));
        }
        Ok(())
    }

    fn inactive(&self) -> RpcError {
        RpcError::Inactive(self.state())
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        tokio::select! {
            biased;
            _ = self.inner.terminated.cancelled() => Err(self.inactive()),
            sent = self.inner.outbound.send(frame) => {
                sent.map_err(|_| RpcError::Inactive(CallState::Cancelled))
            }
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method)
            .field("shape", &self.inner.shape)
            .field("state", &self.state())
            .finish()
    }
}

fn run_callback(call_id: CallId, callback: CompletionCallback, outcome: &CallOutcome) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        error!(call_id, "completion callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn test_call(
        shape: CallShape,
        deadline: Option<Instant>,
    ) -> (CallContext, mpsc::Sender<Inbound>, mpsc::Receiver<Frame>) {
        test_call_with_outbound(shape, deadline, 8)
    }

    fn test_call_with_outbound(
        shape: CallShape,
        deadline: Option<Instant>,
        outbound_capacity: usize,
    ) -> (CallContext, mpsc::Sender<Inbound>, mpsc::Receiver<Frame>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        let ctx = CallContext::new(CallParts {
            id: 1,
            stream: 7,
            method: "/test.Service/Method".to_string(),
            shape,
            invocation_metadata: Metadata::new(),
            peer: Peer::default(),
            deadline,
            max_message_bytes: 16,
            inbound: inbound_rx,
            outbound: outbound_tx,
        });
        (ctx, inbound_tx, outbound_rx)
    }

    #[tokio::test]
    async fn reads_messages_in_order_then_end_of_stream() {
        let (ctx, inbound, _outbound) = test_call(CallShape::BidiStreaming, None);
        inbound
            .send(Inbound::Message(Bytes::from_static(b"one")))
            .await
            .expect("send");
        inbound
            .send(Inbound::Message(Bytes::from_static(b"two")))
            .await
            .expect("send");
        inbound.send(Inbound::HalfClose).await.expect("send");

        assert_eq!(ctx.read().await, Ok(Some(Bytes::from_static(b"one"))));
        assert_eq!(ctx.read().await, Ok(Some(Bytes::from_static(b"two"))));
        assert_eq!(ctx.read().await, Ok(None));
        assert_eq!(ctx.read().await, Ok(None));
    }

    #[tokio::test]
    async fn second_read_while_outstanding_is_rejected() {
        let (ctx, inbound, _outbound) = test_call(CallShape::BidiStreaming, None);
        let pending = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.read().await })
        };
        tokio::task::yield_now().await;

        assert_eq!(ctx.read().await, Err(RpcError::ConcurrentRead));

        inbound
            .send(Inbound::Message(Bytes::from_static(b"first")))
            .await
            .expect("send");
        let first = pending.await.expect("reader task");
        assert_eq!(first, Ok(Some(Bytes::from_static(b"first"))));
    }

    #[tokio::test]
    async fn second_write_while_outstanding_is_rejected() {
        // Room for the implicit headers only, so the first message waits for the reader.
        let (ctx, _inbound, mut outbound) =
            test_call_with_outbound(CallShape::BidiStreaming, None, 1);
        let pending = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.write(Bytes::from_static(b"first")).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            ctx.write(Bytes::from_static(b"second")).await,
            Err(RpcError::ConcurrentWrite)
        );
        assert_eq!(
            ctx.send_initial_metadata(Metadata::new()).await,
            Err(RpcError::ConcurrentWrite)
        );

        assert!(matches!(outbound.recv().await, Some(Frame::Headers { .. })));
        assert_eq!(
            outbound.recv().await,
            Some(Frame::Message {
                stream: 7,
                payload: Bytes::from_static(b"first")
            })
        );
        assert_eq!(pending.await.expect("writer task"), Ok(()));
        assert!(ctx.is_active());
    }

    #[tokio::test]
    async fn first_write_sends_empty_initial_metadata() {
        let (ctx, _inbound, mut outbound) = test_call(CallShape::ServerStreaming, None);

        ctx.write(Bytes::from_static(b"hello")).await.expect("write");

        assert_eq!(
            outbound.recv().await,
            Some(Frame::Headers {
                stream: 7,
                metadata: Metadata::new()
            })
        );
        assert_eq!(
            outbound.recv().await,
            Some(Frame::Message {
                stream: 7,
                payload: Bytes::from_static(b"hello")
            })
        );

        let late = ctx.send_initial_metadata(Metadata::new()).await;
        assert_eq!(late, Err(RpcError::InitialMetadataAlreadySent));
    }

    #[tokio::test]
    async fn explicit_initial_metadata_precedes_first_message() {
        let (ctx, _inbound, mut outbound) = test_call(CallShape::BidiStreaming, None);
        let metadata: Metadata = [("x-request-id", "abc")].into_iter().collect();

        ctx.send_initial_metadata(metadata.clone())
            .await
            .expect("initial metadata");
        ctx.write(Bytes::from_static(b"hi")).await.expect("write");

        assert_eq!(
            outbound.recv().await,
            Some(Frame::Headers {
                stream: 7,
                metadata
            })
        );
        assert!(matches!(
            outbound.recv().await,
            Some(Frame::Message { .. })
        ));
        assert_eq!(
            ctx.send_initial_metadata(Metadata::new()).await,
            Err(RpcError::InitialMetadataAlreadySent)
        );
    }

    #[tokio::test]
    async fn single_response_shapes_reject_write() {
        let (ctx, _inbound, _outbound) = test_call(CallShape::Unary, None);

        let result = ctx.write(Bytes::from_static(b"x")).await;
        assert_eq!(result, Err(RpcError::WriteNotAllowed(CallShape::Unary)));
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let (ctx, _inbound, _outbound) = test_call(CallShape::BidiStreaming, None);

        let result = ctx.write(Bytes::from(vec![0u8; 17])).await;
        assert_eq!(
            result,
            Err(RpcError::MessageTooLarge {
                size: 17,
                limit: 16
            })
        );
    }

    #[tokio::test]
    async fn abort_sends_status_and_blocks_further_writes() {
        let (ctx, _inbound, mut outbound) = test_call(CallShape::BidiStreaming, None);
        ctx.set_code(StatusCode::NotFound);

        let signal = ctx.abort(StatusCode::PermissionDenied, "no access").await;

        assert_eq!(signal.status().code, StatusCode::PermissionDenied);
        assert_eq!(
            outbound.recv().await,
            Some(Frame::Status {
                stream: 7,
                status: Status::new(StatusCode::PermissionDenied, "no access"),
            })
        );
        assert_eq!(ctx.state(), CallState::Aborted);
        assert_eq!(
            ctx.write(Bytes::from_static(b"late")).await,
            Err(RpcError::Inactive(CallState::Aborted))
        );

        ctx.set_code(StatusCode::Ok);
        assert_eq!(ctx.code(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn abort_with_ok_is_sent_as_unknown() {
        let (ctx, _inbound, _outbound) = test_call(CallShape::BidiStreaming, None);

        let signal = ctx.abort(StatusCode::Ok, "confused").await;
        assert_eq!(signal.status().code, StatusCode::Unknown);
    }

    #[tokio::test]
    async fn terminate_unblocks_pending_read() {
        let (ctx, _inbound, _outbound) = test_call(CallShape::BidiStreaming, None);
        let pending = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.read().await })
        };
        tokio::task::yield_now().await;

        assert!(ctx.terminate(CallState::Cancelled, None).await);
        assert!(!ctx.terminate(CallState::Completed, None).await);

        let result = pending.await.expect("reader task");
        assert_eq!(result, Err(RpcError::Inactive(CallState::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn operations_after_deadline_fail() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let (ctx, _inbound, _outbound) = test_call(CallShape::BidiStreaming, Some(deadline));
        assert!(ctx.is_active());

        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!ctx.is_active());
        assert_eq!(ctx.time_remaining(), Some(Duration::ZERO));
        assert_eq!(
            ctx.read().await,
            Err(RpcError::Inactive(CallState::DeadlineExceeded))
        );
        assert_eq!(
            ctx.write(Bytes::from_static(b"x")).await,
            Err(RpcError::Inactive(CallState::DeadlineExceeded))
        );
    }

    #[tokio::test]
    async fn callbacks_fire_exactly_once() {
        let (ctx, _inbound, _outbound) = test_call(CallShape::BidiStreaming, None);
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            ctx.add_callback(move |outcome| {
                assert_eq!(outcome.state, CallState::Completed);
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let outcome = ctx.finish().await;
        ctx.finish().await;
        assert_eq!(outcome.status, Some(Status::ok()));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let late = fired.clone();
        ctx.add_callback(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn status_fields_are_used_on_normal_completion() {
        let (ctx, _inbound, mut outbound) = test_call(CallShape::BidiStreaming, None);
        ctx.set_code(StatusCode::NotFound);
        ctx.set_details("nothing here");
        ctx.set_trailing_metadata([("x-hint", "retry")].into_iter().collect())
            .expect("valid trailers");

        ctx.finish().await;

        let Some(Frame::Status { status, .. }) = outbound.recv().await else {
            panic!("expected status frame");
        };
        assert_eq!(status.code, StatusCode::NotFound);
        assert_eq!(status.details, "nothing here");
        assert_eq!(status.trailing_metadata.len(), 1);
    }
}
