//! The server runtime
//!
//! A [`Server`] owns its listening ports, the routing table and the registry of active calls,
//! and walks the lifecycle `CREATED → STARTED → STOPPING → STOPPED`. Ports and handlers are
//! fixed at `start`; `stop` stops accepting calls and drains the rest, forcibly cancelling
//! whatever is still running when the drain timer fires.

mod dispatch;
mod registry;

use std::{
    fmt,
    net::{IpAddr, SocketAddr, TcpListener as StdTcpListener},
    sync::{atomic::AtomicU64, Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::call::CallState;
use crate::errors::ServerError;
use crate::handler::{Router, RouterBuilder, ServiceHandlers};
use crate::rpc::Status;
use crate::timer::{deadline_after, DrainTimer};
use crate::transport::{connection::accept_loop, credentials::ServerCredentials};

pub(crate) use dispatch::AcceptedCall;
use registry::ActiveCalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Created,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

/// Per-server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Largest message accepted from or sent to a client.
    pub max_message_bytes: usize,
    /// Request messages buffered per call. A call that falls further behind fails with
    /// RESOURCE_EXHAUSTED rather than stalling its connection.
    pub inbound_buffer: usize,
    /// Frames buffered per connection before writers wait.
    pub outbound_buffer: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_message_bytes: 4 * 1024 * 1024,
            inbound_buffer: 32,
            outbound_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub address: SocketAddr,
    pub secure: bool,
}

struct BoundPort {
    info: PortInfo,
    // Taken when the server starts.
    listener: Option<StdTcpListener>,
    credentials: Option<Arc<dyn ServerCredentials>>,
}

#[derive(Default)]
struct Lifecycle {
    handlers: RouterBuilder,
    ports: Vec<BoundPort>,
    drain: Option<Arc<DrainTimer>>,
    started_at: Option<DateTime<Utc>>,
}

pub(crate) struct ServerInner {
    options: ServerOptions,
    state: watch::Sender<ServerState>,
    lifecycle: Mutex<Lifecycle>,
    router: OnceLock<Arc<Router>>,
    calls: ActiveCalls,
    next_call_id: AtomicU64,
    // Cancelled when the server stops admitting calls.
    accepting: CancellationToken,
    // Cancelled once the server is STOPPED; tears down the remaining connections.
    stopped: CancellationToken,
}

impl ServerInner {
    pub(crate) fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub(crate) fn accepting(&self) -> &CancellationToken {
        &self.accepting
    }

    pub(crate) fn stopped_token(&self) -> CancellationToken {
        self.stopped.clone()
    }

    fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Completes a shutdown once the last active call is gone.
    fn check_drained(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() != ServerState::Stopping || !self.calls.is_empty() {
            return;
        }
        self.state.send_replace(ServerState::Stopped);
        self.stopped.cancel();
        if let Some(drain) = lifecycle.drain.take() {
            drain.disarm();
        }
        info!("server stopped");
    }
}

/// Server runtime. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self {
            inner: Arc::new(ServerInner {
                options,
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
                router: OnceLock::new(),
                calls: ActiveCalls::default(),
                next_call_id: AtomicU64::new(1),
                accepting: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Adds a set of method handlers to the routing table.
    pub fn register_handlers(&self, handlers: ServiceHandlers) -> Result<(), ServerError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        self.require_created("register_handlers")?;
        debug!(service = handlers.service(), "registering handlers");
        lifecycle.handlers.add(handlers);
        Ok(())
    }

    /// Binds a plaintext port. A requested port of 0 resolves to an ephemeral port.
    pub fn bind_insecure_port(&self, address: &str) -> Result<u16, ServerError> {
        self.bind_port(address, None)
    }

    /// Binds a port whose connections are secured by `credentials`.
    pub fn bind_secure_port(
        &self,
        address: &str,
        credentials: Arc<dyn ServerCredentials>,
    ) -> Result<u16, ServerError> {
        self.bind_port(address, Some(credentials))
    }

    fn bind_port(
        &self,
        address: &str,
        credentials: Option<Arc<dyn ServerCredentials>>,
    ) -> Result<u16, ServerError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        self.require_created("bind_port")?;

        let target = with_default_port(address);
        let listener = StdTcpListener::bind(target.as_str())
            .and_then(|listener| listener.set_nonblocking(true).map(|()| listener))
            .map_err(|err| ServerError::bind(address, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| ServerError::bind(address, err))?;

        let secure = credentials.is_some();
        info!(requested = address, bound = %local, secure, "port bound");
        lifecycle.ports.push(BoundPort {
            info: PortInfo {
                address: local,
                secure,
            },
            listener: Some(listener),
            credentials,
        });
        Ok(local.port())
    }

    /// Freezes handlers and ports and begins accepting connections.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listeners = {
            let mut lifecycle = self.inner.lifecycle.lock();
            self.require_created("start")?;

            let mut listeners = Vec::with_capacity(lifecycle.ports.len());
            for port in &mut lifecycle.ports {
                if let Some(listener) = port.listener.take() {
                    let listener = TcpListener::from_std(listener).map_err(|err| {
                        ServerError::bind(port.info.address.to_string(), err)
                    })?;
                    listeners.push((listener, port.credentials.clone()));
                }
            }

            let router = std::mem::take(&mut lifecycle.handlers).build();
            let routes = router.len();
            let _ = self.inner.router.set(Arc::new(router));
            lifecycle.started_at = Some(Utc::now());
            self.inner.state.send_replace(ServerState::Started);
            info!(ports = listeners.len(), routes, "server started");
            listeners
        };

        for (listener, credentials) in listeners {
            tokio::spawn(accept_loop(self.inner.clone(), listener, credentials));
        }
        Ok(())
    }

    /// Stops accepting calls and drains the active ones.
    ///
    /// With a `grace` period this returns immediately and cancels whatever is still running
    /// when the period ends. Without one, active calls are cancelled now and this waits until
    /// their handlers have finished. Repeated calls can only bring the drain deadline earlier.
    pub async fn stop(&self, grace: Option<Duration>) {
        let deadline = deadline_after(grace.unwrap_or(Duration::ZERO));
        let drain = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match self.state() {
                ServerState::Stopped => None,
                ServerState::Stopping => {
                    if let Some(drain) = &lifecycle.drain {
                        if drain.advance_to(deadline) {
                            info!(grace_ms = grace_ms(grace), "drain deadline moved earlier");
                        }
                    }
                    None
                }
                ServerState::Created | ServerState::Started => {
                    self.inner.state.send_replace(ServerState::Stopping);
                    self.inner.accepting.cancel();
                    // Ports that never started just close.
                    lifecycle.ports.iter_mut().for_each(|port| {
                        port.listener.take();
                    });
                    let drain = Arc::new(DrainTimer::new(deadline));
                    lifecycle.drain = Some(drain.clone());
                    info!(
                        grace_ms = grace_ms(grace),
                        active_calls = self.inner.calls.len(),
                        "server stopping"
                    );
                    Some(drain)
                }
            }
        };

        if let Some(drain) = drain {
            tokio::spawn(drain_calls(self.inner.clone(), drain));
        }
        self.inner.check_drained();

        if grace.is_none() {
            self.wait_for_termination(None).await;
        }
    }

    /// Waits until the server is STOPPED. Returns `true` if `timeout` elapsed first.
    pub async fn wait_for_termination(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.inner.state.subscribe();
        let stopped = async move {
            // The sender lives in `inner`, which this handle keeps alive.
            let _ = state.wait_for(|state| *state == ServerState::Stopped).await;
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, stopped).await.is_err(),
            None => {
                stopped.await;
                false
            }
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// When the drain will force-cancel remaining calls, while a shutdown is in progress.
    pub fn drain_deadline(&self) -> Option<Instant> {
        self.inner
            .lifecycle
            .lock()
            .drain
            .as_ref()
            .map(|drain| drain.deadline())
    }

    pub fn active_call_count(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn bound_ports(&self) -> Vec<PortInfo> {
        self.inner
            .lifecycle
            .lock()
            .ports
            .iter()
            .map(|port| port.info)
            .collect()
    }

    /// Fully qualified names of every registered method.
    pub fn method_names(&self) -> Vec<String> {
        match self.inner.router.get() {
            Some(router) => router.method_names(),
            None => self.inner.lifecycle.lock().handlers.method_names(),
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lifecycle.lock().started_at
    }

    fn require_created(&self, operation: &'static str) -> Result<(), ServerError> {
        match self.state() {
            ServerState::Created => Ok(()),
            state => Err(ServerError::invalid_state(operation, state)),
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("active_calls", &self.active_call_count())
            .finish_non_exhaustive()
    }
}

/// Cancels every call still active when `drain` fires.
async fn drain_calls(server: Arc<ServerInner>, drain: Arc<DrainTimer>) {
    if !drain.expired().await {
        return;
    }

    let remaining = server.calls.snapshot();
    if !remaining.is_empty() {
        info!(calls = remaining.len(), "drain deadline reached, cancelling calls");
    }
    join_all(remaining.iter().map(|ctx| {
        ctx.terminate(
            CallState::Cancelled,
            Some(Status::cancelled("Server is shutting down")),
        )
    }))
    .await;
}

fn grace_ms(grace: Option<Duration>) -> u64 {
    grace.map_or(0, |grace| u64::try_from(grace.as_millis()).unwrap_or(u64::MAX))
}

/// Adds port 0 to addresses that name only a host.
fn with_default_port(address: &str) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    let host = address.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, 0).to_string(),
        Err(_) if address.contains(':') => address.to_string(),
        Err(_) => format!("{address}:0"),
    }
}
