//! Per-call dispatch: admission, handler execution and terminal bookkeeping.

use std::{
    panic::AssertUnwindSafe,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use bytes::Bytes;
use futures::FutureExt;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info_span, warn, Instrument};

use super::{ServerInner, ServerState};
use crate::call::{CallContext, CallParts, CallState, Inbound, Peer};
use crate::errors::{HandlerError, RpcError};
use crate::handler::MethodHandler;
use crate::logging::log_call_summary;
use crate::rpc::{Status, StatusCode};
use crate::timer::{deadline_after, DrainTimer};
use crate::transport::frame::{CallHeader, Frame};

const HANDLER_FAULT_DETAILS: &str = "Unexpected error in handler";

/// A call admitted by the server, as seen by its connection.
pub(crate) struct AcceptedCall {
    pub ctx: CallContext,
    pub inbound: mpsc::Sender<Inbound>,
}

impl ServerInner {
    /// Admits a call the client opened on `stream`, or answers it with a rejection status.
    pub(crate) async fn accept_call(
        self: &Arc<Self>,
        stream: u32,
        header: CallHeader,
        peer: Peer,
        outbound: mpsc::Sender<Frame>,
        finished: mpsc::UnboundedSender<u32>,
    ) -> Option<AcceptedCall> {
        let handler = self
            .router
            .get()
            .and_then(|router| router.lookup(&header.method))
            .cloned();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.options.inbound_buffer);

        let admitted = {
            // Serializes admission with `stop`, so no call slips in after STOPPING.
            let _lifecycle = self.lifecycle.lock();
            match (self.state(), handler) {
                (ServerState::Started, Some(handler)) => {
                    let ctx = CallContext::new(CallParts {
                        id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
                        stream,
                        shape: handler.shape(),
                        method: header.method.clone(),
                        invocation_metadata: header.metadata,
                        peer,
                        deadline: header
                            .timeout_ms
                            .map(|timeout| deadline_after(Duration::from_millis(timeout))),
                        max_message_bytes: self.options.max_message_bytes,
                        inbound: inbound_rx,
                        outbound: outbound.clone(),
                    });
                    self.calls.insert(ctx.clone());
                    Ok((ctx, handler))
                }
                (ServerState::Started, None) => Err(Status::unimplemented("Method not found!")),
                (state, _) => Err(Status::unavailable(format!(
                    "server is {state} and not accepting calls"
                ))),
            }
        };

        match admitted {
            Ok((ctx, handler)) => {
                tokio::spawn(run_call(self.clone(), ctx.clone(), handler, finished));
                Some(AcceptedCall {
                    ctx,
                    inbound: inbound_tx,
                })
            }
            Err(status) => {
                debug!(stream, method = %header.method, code = %status.code, "call rejected");
                if outbound.send(Frame::Status { stream, status }).await.is_err() {
                    debug!(stream, "connection closed before rejection was sent");
                }
                None
            }
        }
    }
}

async fn run_call(
    server: Arc<ServerInner>,
    ctx: CallContext,
    handler: MethodHandler,
    finished: mpsc::UnboundedSender<u32>,
) {
    let started = Instant::now();
    let span = info_span!("call", call_id = ctx.id(), method = %ctx.method());
    async {
        drive(&ctx, &handler).await;
        let outcome = ctx.finish().await;
        log_call_summary(&ctx, &outcome, started.elapsed());
    }
    .instrument(span)
    .await;

    let _ = finished.send(ctx.stream());
    server.calls.remove(&ctx);
    server.check_drained();
}

/// Runs the handler until it returns or the call ends underneath it.
async fn drive(ctx: &CallContext, handler: &MethodHandler) {
    let deadline = ctx.deadline().map(DrainTimer::new);
    let invocation = AssertUnwindSafe(handler.invoke(ctx.clone())).catch_unwind();

    // Losing branches drop the handler at its current suspension point.
    let result = tokio::select! {
        biased;
        result = invocation => Some(result),
        _ = ctx.terminated() => None,
        _ = deadline_elapsed(deadline.as_ref()) => {
            ctx.terminate(CallState::DeadlineExceeded, Some(Status::deadline_exceeded()))
                .await;
            None
        }
    };

    match result {
        None => {}
        Some(Err(_panic)) => {
            error!("handler panicked");
            ctx.terminate(CallState::Aborted, Some(handler_fault_status()))
                .await;
        }
        Some(Ok(Ok(response))) => complete(ctx, response).await,
        Some(Ok(Err(err))) => fail(ctx, err).await,
    }
}

async fn deadline_elapsed(timer: Option<&DrainTimer>) {
    let Some(timer) = timer else {
        return std::future::pending().await;
    };
    if !timer.expired().await {
        std::future::pending::<()>().await;
    }
}

async fn complete(ctx: &CallContext, response: Option<Bytes>) {
    if let Some(response) = response {
        // A handler that set an error code has its reply discarded.
        if ctx.code().is_ok() {
            if let Err(err) = ctx.write_message(response).await {
                fail(ctx, HandlerError::Stream(err)).await;
                return;
            }
        }
    }
    ctx.terminate(CallState::Completed, Some(ctx.pending_status()))
        .await;
}

async fn fail(ctx: &CallContext, err: HandlerError) {
    if ctx.state().is_terminal() {
        debug!(error = %err, "handler returned after the call ended");
        return;
    }

    match err {
        HandlerError::Aborted(signal) => {
            ctx.terminate(CallState::Aborted, Some(signal.status().clone()))
                .await;
        }
        HandlerError::Stream(RpcError::Inactive(CallState::DeadlineExceeded)) => {
            ctx.terminate(CallState::DeadlineExceeded, Some(Status::deadline_exceeded()))
                .await;
        }
        HandlerError::Stream(err @ RpcError::MessageTooLarge { .. }) => {
            warn!(error = %err, "handler produced an oversized message");
            ctx.terminate(
                CallState::Aborted,
                Some(Status::new(StatusCode::ResourceExhausted, err.to_string())),
            )
            .await;
        }
        HandlerError::Stream(err) => {
            warn!(error = %err, "handler failed on a stream operation");
            ctx.terminate(CallState::Aborted, Some(Status::internal(err.to_string())))
                .await;
        }
        HandlerError::Fault(err) => {
            error!(error = %err, "handler failed");
            ctx.terminate(CallState::Aborted, Some(handler_fault_status()))
                .await;
        }
    }
}

fn handler_fault_status() -> Status {
    Status::new(StatusCode::Unknown, HANDLER_FAULT_DETAILS)
}
