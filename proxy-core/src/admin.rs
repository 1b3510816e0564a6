use crate::gate::PendingReview;
use crate::pipeline::PipelineContext;
use crate::registry::ConnectionRegistry;
use crate::replay::{ReplayController, ReplayReport};
use crate::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use proxy_common::{ConnectionId, Direction, Exchange, ExchangeId, GroupId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::info;

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct Metrics {
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub exchanges_recorded: AtomicU64,
    pub exchanges_intercepted: AtomicU64,
    pub exchanges_dropped: AtomicU64,
    pub replay_units_succeeded: AtomicU64,
    pub replay_units_failed: AtomicU64,
    // Engine terminations
    pub transport_faults: AtomicU64,
    pub watchdog_stalls: AtomicU64,
    pub hook_faults: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsResponse {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub live_sessions: usize,
    pub exchanges_recorded: u64,
    pub exchanges_intercepted: u64,
    pub exchanges_dropped: u64,
    pub replay_units_succeeded: u64,
    pub replay_units_failed: u64,
    pub transport_faults: u64,
    pub watchdog_stalls: u64,
    pub hook_faults: u64,
}

impl Metrics {
    pub fn snapshot(&self, live_sessions: usize) -> MetricsResponse {
        MetricsResponse {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            live_sessions,
            exchanges_recorded: self.exchanges_recorded.load(Ordering::Relaxed),
            exchanges_intercepted: self.exchanges_intercepted.load(Ordering::Relaxed),
            exchanges_dropped: self.exchanges_dropped.load(Ordering::Relaxed),
            replay_units_succeeded: self.replay_units_succeeded.load(Ordering::Relaxed),
            replay_units_failed: self.replay_units_failed.load(Ordering::Relaxed),
            transport_faults: self.transport_faults.load(Ordering::Relaxed),
            watchdog_stalls: self.watchdog_stalls.load(Ordering::Relaxed),
            hook_faults: self.hook_faults.load(Ordering::Relaxed),
        }
    }
}

/// Everything the operator API reaches into
#[derive(Clone)]
pub struct AdminState {
    pub ctx: PipelineContext,
    pub registry: Arc<ConnectionRegistry>,
    pub replay: Arc<ReplayController>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct InterceptStatus {
    armed: bool,
    waiting: bool,
    pending: Option<PendingReview>,
}

/// One row of the history listing
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: ExchangeId,
    pub direction: Direction,
    pub conn: ConnectionId,
    pub group: GroupId,
    pub server: String,
    pub codec: String,
    pub content_type: String,
    pub modified: bool,
    pub resend: bool,
    pub size: usize,
    pub summary: String,
}

impl From<&Exchange> for HistoryEntry {
    fn from(exchange: &Exchange) -> Self {
        Self {
            id: exchange.id,
            direction: exchange.direction,
            conn: exchange.conn,
            group: exchange.group,
            server: exchange.addressing.server_name.clone(),
            codec: exchange.codec.clone(),
            content_type: exchange.content_type.clone(),
            modified: exchange.modified,
            resend: exchange.resend,
            size: exchange.sent.len().max(exchange.received.len()),
            summary: exchange.summary(),
        }
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ReplayQuery {
    count: Option<usize>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/intercept", get(intercept_status_handler))
        .route("/intercept/enable", post(intercept_enable_handler))
        .route("/intercept/disable", post(intercept_disable_handler))
        .route("/intercept/forward", post(intercept_forward_handler))
        .route("/intercept/forward-multiple", post(intercept_forward_multiple_handler))
        .route("/intercept/drop", post(intercept_drop_handler))
        .route("/history", get(history_handler))
        .route("/history/:id", get(history_entry_handler))
        .route("/replay/:id", post(replay_handler))
        .with_state(state)
}

pub async fn start_admin_server(port: u16, state: AdminState) -> Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        crate::error::ProxyError::transport(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::ProxyError::transport(format!("Admin server failed: {}", e)))?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> Json<MetricsResponse> {
    Json(state.ctx.metrics.snapshot(state.registry.len()))
}

async fn intercept_status_handler(State(state): State<AdminState>) -> Json<InterceptStatus> {
    let gate = &state.ctx.gate;
    Json(InterceptStatus {
        armed: gate.is_armed(),
        waiting: gate.is_waiting(),
        pending: gate.pending(),
    })
}

async fn intercept_enable_handler(State(state): State<AdminState>) -> StatusCode {
    state.ctx.gate.enable_intercept_mode();
    StatusCode::NO_CONTENT
}

async fn intercept_disable_handler(State(state): State<AdminState>, body: Bytes) -> StatusCode {
    let data = if body.is_empty() {
        None
    } else {
        Some(body.to_vec())
    };
    state.ctx.gate.disable_intercept_mode(data);
    StatusCode::NO_CONTENT
}

fn verdict_status(delivered: bool) -> StatusCode {
    if delivered {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CONFLICT
    }
}

async fn intercept_forward_handler(State(state): State<AdminState>, body: Bytes) -> StatusCode {
    verdict_status(state.ctx.gate.forward(body.to_vec()))
}

async fn intercept_forward_multiple_handler(
    State(state): State<AdminState>,
    body: Bytes,
) -> StatusCode {
    verdict_status(state.ctx.gate.forward_multiple(body.to_vec()).await)
}

async fn intercept_drop_handler(State(state): State<AdminState>) -> StatusCode {
    verdict_status(state.ctx.gate.drop_exchange())
}

async fn history_handler(
    State(state): State<AdminState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<HistoryEntry>> {
    let exchanges = match query.limit {
        Some(limit) => state.ctx.history.latest(limit),
        None => state.ctx.history.all(),
    };
    Json(exchanges.iter().map(HistoryEntry::from).collect())
}

async fn history_entry_handler(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.ctx.history.get(ExchangeId(id)) {
        Some(exchange) => Json(exchange).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn replay_handler(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Query(query): Query<ReplayQuery>,
) -> std::result::Result<Json<ReplayReport>, StatusCode> {
    let exchange = state
        .ctx
        .history
        .get(ExchangeId(id))
        .ok_or(StatusCode::NOT_FOUND)?;
    let count = query.count.unwrap_or(1).max(1);
    let report = state.replay.run(exchange.resend_snapshot(), count).await;
    Ok(Json(report))
}
