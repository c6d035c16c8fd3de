use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::server::{PortInfo, ServerState};
use crate::AdminState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub state: ServerState,
    pub started_at: Option<DateTime<Utc>>,
    pub active_calls: usize,
    /// Milliseconds until remaining calls are cancelled, while draining.
    pub drain_remaining_ms: Option<u64>,
    pub ports: Vec<PortInfo>,
    pub methods: Vec<String>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn status(State(state): State<AdminState>) -> Json<StatusResponse> {
    let server = &state.server;
    let drain_remaining_ms = server.drain_deadline().map(|deadline| {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)
    });

    Json(StatusResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        state: server.state(),
        started_at: server.started_at(),
        active_calls: server.active_call_count(),
        drain_remaining_ms,
        ports: server.bound_ports(),
        methods: server.method_names(),
    })
}
