//! Replay of recorded exchanges
//!
//! A replay run turns one snapshot into N send units. The codec decides how
//! units reach the server:
//!
//! - new connection: each unit dials its own synchronous session and also
//!   reads the response back;
//! - shared connection: each unit writes through a sibling of the original
//!   live session; the response surfaces later through that session's own
//!   pipeline;
//! - direct: neither a new connection nor a new codec, so units go through
//!   the original session's forced send hooks, one after another.
//!
//! Every unit is prepared before the first one fires. Units fire with
//! bounded parallelism and fail independently.

use async_trait::async_trait;
use proxy_common::{Direction, Snapshot};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::ReplayConfig;
use crate::error::ProxyError;
use crate::gate::Resender;
use crate::pipeline::{assemble_one_shot, assemble_shared_replay, PipelineContext};
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::transport::Dialer;
use crate::Result;

/// Result note for units sent over an already connected transport
pub const SHARED_CONNECTION_NOTE: &str = "In case that packets were resent to an already connected socket, results can't be displayed here. See the history instead.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    NewConnection,
    SharedConnection,
    Direct,
}

impl ReplayMode {
    pub fn for_codec(codec: &dyn Codec, direction: Direction) -> Self {
        if direction == Direction::Server {
            return ReplayMode::Direct;
        }
        match (
            codec.use_new_connection_for_resend(),
            codec.use_new_codec_for_resend(),
        ) {
            (true, _) => ReplayMode::NewConnection,
            (false, true) => ReplayMode::SharedConnection,
            (false, false) => ReplayMode::Direct,
        }
    }
}

/// Outcome of one send unit
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ReplayResult {
    /// Response read back on a fresh connection
    Response(Snapshot),
    /// Sent; the response is only visible in history
    Dispatched(String),
    Failed(String),
}

impl ReplayResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, ReplayResult::Failed(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<ReplayResult>,
}

impl ReplayReport {
    fn from_results(results: Vec<ReplayResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }
}

/// A prepared unit, ready to fire
enum Unit {
    Fresh {
        session: Arc<Session>,
        prepared: Vec<u8>,
    },
    Shared {
        session: Arc<Session>,
        prepared: Vec<u8>,
    },
    Failed(String),
}

#[derive(Clone)]
pub struct ReplayController {
    ctx: PipelineContext,
    registry: Arc<ConnectionRegistry>,
    dialer: Arc<dyn Dialer>,
    limit: Arc<Semaphore>,
    config: ReplayConfig,
}

impl ReplayController {
    pub fn new(
        ctx: PipelineContext,
        registry: Arc<ConnectionRegistry>,
        dialer: Arc<dyn Dialer>,
        config: &ReplayConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            dialer,
            limit: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            config: config.clone(),
        }
    }

    /// Replay `snapshot` `count` times and wait for every unit
    pub async fn run(&self, snapshot: Snapshot, count: usize) -> ReplayReport {
        let count = count.max(1);
        let results = match self
            .ctx
            .codecs
            .create(&snapshot.codec, snapshot.alpn.as_deref())
        {
            Ok(codec) => match ReplayMode::for_codec(codec.as_ref(), snapshot.direction) {
                ReplayMode::Direct => self.run_direct(&snapshot, count).await,
                mode => self.run_units(&snapshot, count, mode, codec).await,
            },
            Err(e) => {
                warn!("replay of {} aborted: {}", snapshot.conn, e);
                vec![ReplayResult::Failed(e.to_string()); count]
            }
        };

        let report = ReplayReport::from_results(results);
        let metrics = &self.ctx.metrics;
        metrics
            .replay_units_succeeded
            .fetch_add(report.succeeded as u64, Ordering::Relaxed);
        metrics
            .replay_units_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        info!(
            "🔁 Replay on {} finished: {} succeeded, {} failed",
            snapshot.conn, report.succeeded, report.failed
        );
        report
    }

    fn original(&self, snapshot: &Snapshot) -> Result<Arc<Session>> {
        self.registry.get(snapshot.conn).ok_or_else(|| {
            warn!("tried to resend packets, but the connection was already closed");
            ProxyError::ConnectionGone {
                conn: snapshot.conn,
            }
        })
    }

    async fn run_direct(&self, snapshot: &Snapshot, count: usize) -> Vec<ReplayResult> {
        let original = match self.original(snapshot) {
            Ok(session) => session,
            Err(e) => return vec![ReplayResult::Failed(e.to_string()); count],
        };
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            let sent = match snapshot.direction {
                Direction::Client => original.send_to_server(snapshot.data.clone()).await,
                Direction::Server => original.send_to_client(snapshot.data.clone()).await,
            };
            results.push(match sent {
                Ok(()) => ReplayResult::Dispatched(SHARED_CONNECTION_NOTE.to_string()),
                Err(e) => {
                    warn!("direct resend on {} failed: {}", snapshot.conn, e);
                    ReplayResult::Failed(e.to_string())
                }
            });
        }
        results
    }

    async fn build_unit(&self, snapshot: &Snapshot, mode: ReplayMode) -> Unit {
        let built = match mode {
            ReplayMode::NewConnection => self.build_fresh(snapshot).await,
            _ => self.build_shared(snapshot).await,
        };
        match built {
            Ok(unit) => unit,
            Err(e) => Unit::Failed(e.to_string()),
        }
    }

    async fn build_fresh(&self, snapshot: &Snapshot) -> Result<Unit> {
        let endpoint = self
            .dialer
            .dial(&snapshot.addressing, snapshot.alpn.as_deref())
            .await?;
        let session = assemble_one_shot(&self.ctx, Arc::new(endpoint), snapshot)?;
        match session.prepare(snapshot.data.clone()).await {
            Ok(prepared) => Ok(Unit::Fresh { session, prepared }),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn build_shared(&self, snapshot: &Snapshot) -> Result<Unit> {
        let original = self.original(snapshot)?;
        let session = assemble_shared_replay(&self.ctx, &original, snapshot)?;
        let prepared = session.prepare(snapshot.data.clone()).await?;
        Ok(Unit::Shared { session, prepared })
    }

    async fn run_units(
        &self,
        snapshot: &Snapshot,
        count: usize,
        mode: ReplayMode,
        codec: Arc<dyn Codec>,
    ) -> Vec<ReplayResult> {
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(self.build_unit(snapshot, mode).await);
        }
        debug!("{} {:?} replay unit(s) prepared for {}", count, mode, snapshot.conn);

        let mut results: Vec<Option<ReplayResult>> = vec![None; count];
        let mut tasks = JoinSet::new();
        for (index, unit) in units.into_iter().enumerate() {
            let limit = self.limit.clone();
            let codec = codec.clone();
            let snapshot = snapshot.clone();
            let response_timeout = self.config.response_timeout();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let result = fire(unit, &snapshot, codec.as_ref(), response_timeout).await;
                (index, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("replay unit task failed: {}", e),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| ReplayResult::Failed("unit did not complete".to_string())))
            .collect()
    }

    /// Start a replay in the background. When `wait` is set and `count` is
    /// above one, wait for it up to the configured ceiling.
    pub async fn resend(&self, snapshot: Snapshot, count: usize, wait: bool) -> Option<ReplayReport> {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(snapshot, count).await });
        if !(wait && count > 1) {
            return None;
        }
        let ceiling = self.config.wait_ceiling();
        match tokio::time::timeout(ceiling, handle).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!("replay task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("replay still running after {:?}, not waiting any longer", ceiling);
                None
            }
        }
    }

    /// Start a replay in the background and hand the report to `callback`
    pub fn resend_with_callback<F>(
        &self,
        snapshot: Snapshot,
        count: usize,
        callback: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ReplayReport) + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let report = this.run(snapshot, count).await;
            callback(report);
        })
    }
}

async fn fire(
    unit: Unit,
    snapshot: &Snapshot,
    codec: &dyn Codec,
    response_timeout: std::time::Duration,
) -> ReplayResult {
    match unit {
        Unit::Failed(reason) => ReplayResult::Failed(reason),
        Unit::Shared { session, prepared } => match session.execute(&prepared).await {
            Ok(()) => ReplayResult::Dispatched(SHARED_CONNECTION_NOTE.to_string()),
            Err(e) => ReplayResult::Failed(e.to_string()),
        },
        Unit::Fresh { session, prepared } => {
            let result = exchange_once(&session, &prepared, codec, response_timeout).await;
            session.close().await;
            match result {
                Ok(response) => ReplayResult::Response(snapshot.response(response)),
                Err(e) => {
                    warn!("replay unit on {} failed: {}", session.id(), e);
                    ReplayResult::Failed(e.to_string())
                }
            }
        }
    }
}

/// Write one prepared request and read its final response, skipping interim ones
async fn exchange_once(
    session: &Session,
    prepared: &[u8],
    codec: &dyn Codec,
    response_timeout: std::time::Duration,
) -> Result<Vec<u8>> {
    session.execute(prepared).await?;
    loop {
        let response = tokio::time::timeout(response_timeout, session.receive())
            .await
            .map_err(|_| ProxyError::timeout("replay response", response_timeout))??;
        match response {
            Some(response) if codec.is_interim_response(&response) => {
                debug!("{}: skipping interim response", session.id());
            }
            Some(response) => return Ok(response),
            None => {
                return Err(ProxyError::Replay {
                    reason: "connection closed before a response arrived".to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Resender for ReplayController {
    async fn resend(&self, snapshot: Snapshot, count: usize, wait: bool) -> Option<ReplayReport> {
        ReplayController::resend(self, snapshot, count, wait).await
    }
}
