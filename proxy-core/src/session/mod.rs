//! Bidirectional sessions
//!
//! A [`Session`] pairs a client endpoint with a server endpoint and routes
//! both directions through one installed hook set. Two strategies exist:
//!
//! - **Continuous**: two stream engines run full duplex until either side
//!   disconnects. Server-to-client output passes through a flow-control
//!   channel drained by its own task.
//! - **Synchronous**: no engines. The caller drives one explicit cycle with
//!   [`Session::send`] followed by [`Session::receive`]. Replays that dial a
//!   fresh connection use this.
//!
//! Every session also supports [`Session::prepare`] / [`Session::execute`]
//! so a payload can be encoded (and validated) before anything is written.

pub mod hooks;

use bytes::BytesMut;
use proxy_common::{Addressing, ConnectionId, Direction, ListenerId};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::Metrics;
use crate::config::PipelineConfig;
use crate::engine::{EngineControl, EngineOutcome, EngineTiming, Sink, StreamEngine};
use crate::error::ProxyError;
use crate::transport::{BoxedReader, Endpoint};
use crate::Result;

pub use hooks::{Dispatcher, HookDispatch, SessionHooks};
use hooks::DirectionHooks;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Continuous,
    Synchronous,
}

#[derive(Clone)]
pub struct SessionOptions {
    pub listener: Option<ListenerId>,
    pub timing: EngineTiming,
    pub flow_capacity: usize,
    pub metrics: Option<Arc<Metrics>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for SessionOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            listener: None,
            timing: EngineTiming::from(config),
            flow_capacity: config.flow_control_capacity.max(1),
            metrics: None,
        }
    }
}

impl SessionOptions {
    pub fn with_listener(mut self, listener: ListenerId) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Read state of a synchronous session. Bytes past one response stay
/// buffered for the next `receive`.
#[derive(Default)]
struct ResponseReader {
    reader: Option<BoxedReader>,
    buffer: BytesMut,
}

pub struct Session {
    id: ConnectionId,
    strategy: Strategy,
    client: Option<Arc<Endpoint>>,
    server: Arc<Endpoint>,
    dispatcher: Arc<Dispatcher>,
    control: Arc<EngineControl>,
    options: SessionOptions,
    response: tokio::sync::Mutex<ResponseReader>,
    started: AtomicBool,
    running: AtomicUsize,
    finished: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("listener", &self.options.listener)
            .field("server", &self.server)
            .finish()
    }
}

impl Session {
    fn build(
        strategy: Strategy,
        client: Option<Arc<Endpoint>>,
        server: Arc<Endpoint>,
        options: SessionOptions,
    ) -> Arc<Self> {
        if let Some(metrics) = &options.metrics {
            metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
        }
        Arc::new(Self {
            id: next_connection_id(),
            strategy,
            client,
            server,
            dispatcher: Arc::new(Dispatcher::new()),
            control: Arc::new(EngineControl::new()),
            options,
            response: tokio::sync::Mutex::new(ResponseReader::default()),
            started: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            finished: CancellationToken::new(),
        })
    }

    /// Full-duplex session between an accepted client and its server
    pub fn continuous(
        client: Arc<Endpoint>,
        server: Arc<Endpoint>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Self::build(Strategy::Continuous, Some(client), server, options)
    }

    /// Request/response session over a server endpoint only
    pub fn synchronous(server: Arc<Endpoint>, options: SessionOptions) -> Arc<Self> {
        Self::build(Strategy::Synchronous, None, server, options)
    }

    /// A second session over the same transport, with its own (empty) hook
    /// slot. Used to resend through a live connection with replay hooks.
    pub fn same_connection(&self) -> Arc<Self> {
        let options = SessionOptions {
            metrics: None,
            ..self.options.clone()
        };
        Self::build(self.strategy, self.client.clone(), self.server.clone(), options)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn listener(&self) -> Option<ListenerId> {
        self.options.listener
    }

    pub fn client_endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.client.as_ref()
    }

    pub fn server_endpoint(&self) -> &Arc<Endpoint> {
        &self.server
    }

    /// Addressing of a session that has a client side
    pub fn addressing(&self) -> Option<Addressing> {
        let client = self.client.as_ref()?;
        Some(
            Addressing::new(
                self.options.listener.unwrap_or_default(),
                client.address(),
                self.server.address(),
            )
            .with_server_name(self.server.name())
            .with_tls(self.server.is_tls()),
        )
    }

    pub fn install_hooks(&self, hooks: Arc<dyn SessionHooks>) -> Result<()> {
        self.dispatcher.install(hooks)
    }

    pub fn hooks_installed(&self) -> bool {
        self.dispatcher.is_installed()
    }

    pub fn enable_hooks(&self) {
        self.dispatcher.set_enabled(true);
    }

    pub fn disable_hooks(&self) {
        self.dispatcher.set_enabled(false);
    }

    pub fn dispatch(&self) -> HookDispatch {
        self.dispatcher.current()
    }

    /// Spawn the engines of a continuous session. No-op for synchronous ones.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.strategy == Strategy::Synchronous {
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::hook(format!("{} already started", self.id)));
        }
        let client = self
            .client
            .clone()
            .ok_or_else(|| ProxyError::hook("continuous session without a client endpoint"))?;

        let (flow_tx, flow_rx) = mpsc::channel(self.options.flow_capacity);
        let upstream = StreamEngine::new(
            format!("{} client->server", self.id),
            &client,
            Sink::Writer(self.server.writer()),
            Arc::new(DirectionHooks {
                dispatcher: self.dispatcher.clone(),
                direction: Direction::Client,
            }),
            self.control.clone(),
            self.options.timing,
        )?
        .closing(self.server.clone());
        let downstream = StreamEngine::new(
            format!("{} server->client", self.id),
            &self.server,
            Sink::Flow(flow_tx),
            Arc::new(DirectionHooks {
                dispatcher: self.dispatcher.clone(),
                direction: Direction::Server,
            }),
            self.control.clone(),
            self.options.timing,
        )?
        .closing(client.clone());

        info!(
            "🔗 Session {} started: {} <-> {} ({})",
            self.id,
            client.address(),
            self.server.address(),
            self.server.name()
        );

        self.running.store(2, Ordering::SeqCst);
        for engine in [upstream, downstream] {
            let session = self.clone();
            tokio::spawn(async move {
                let outcome = engine.run().await;
                session.engine_finished(outcome);
            });
        }
        tokio::spawn(flow_task(
            self.id,
            flow_rx,
            self.dispatcher.clone(),
            client,
            self.server.clone(),
        ));
        Ok(())
    }

    fn engine_finished(&self, outcome: EngineOutcome) {
        if let Some(metrics) = &self.options.metrics {
            match &outcome {
                EngineOutcome::Watchdog { .. } => {
                    metrics.watchdog_stalls.fetch_add(1, Ordering::Relaxed);
                    metrics.transport_faults.fetch_add(1, Ordering::Relaxed);
                }
                EngineOutcome::TransportFault(_) => {
                    metrics.transport_faults.fetch_add(1, Ordering::Relaxed);
                }
                EngineOutcome::HookFault(_) => {
                    metrics.hook_faults.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.mark_finished();
        }
    }

    fn mark_finished(&self) {
        if self.finished.is_cancelled() {
            return;
        }
        self.finished.cancel();
        if let Some(metrics) = &self.options.metrics {
            metrics.sessions_closed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Session {} finished", self.id);
    }

    /// Resolves once the session has stopped
    pub async fn closed(&self) {
        self.finished.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Run client-side decode and encode on `data` without touching the transport
    pub async fn prepare(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.strategy {
            Strategy::Continuous => {
                let accepted = self
                    .dispatcher
                    .boundary(Direction::Client, &data)?
                    .accepted(data.len())
                    .ok_or_else(|| {
                        ProxyError::hook("prepared payload is not one complete message")
                    })?;
                let mut data = data;
                data.truncate(accepted);
                let decoded = self.dispatcher.received(Direction::Client, data).await?;
                if decoded.is_empty() {
                    return Ok(decoded);
                }
                self.dispatcher.send(Direction::Client, decoded).await
            }
            Strategy::Synchronous => {
                let accepted = self
                    .dispatcher
                    .boundary(Direction::Client, &data)?
                    .accepted(data.len())
                    .ok_or_else(|| {
                        ProxyError::hook("prepared payload is not one complete message")
                    })?;
                let mut out = self
                    .dispatcher
                    .pass_through(Direction::Client)?
                    .unwrap_or_default();
                let decoded = self
                    .dispatcher
                    .received(Direction::Client, data[..accepted].to_vec())
                    .await?;
                if !decoded.is_empty() {
                    out.extend(self.dispatcher.send(Direction::Client, decoded).await?);
                }
                Ok(out)
            }
        }
    }

    /// Write previously prepared bytes to the server
    pub async fn execute(&self, prepared: &[u8]) -> Result<()> {
        self.server.writer().write_all(prepared).await
    }

    /// Encode and write one request
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        let prepared = self.prepare(data).await?;
        self.execute(&prepared).await
    }

    /// Block until one full response is delimited, decoded and encoded.
    /// `None` at end of stream.
    pub async fn receive(&self) -> Result<Option<Vec<u8>>> {
        if self.strategy != Strategy::Synchronous {
            return Err(ProxyError::unsupported(
                "receive on a continuous session",
            ));
        }
        let mut guard = self.response.lock().await;
        let state = &mut *guard;
        if state.reader.is_none() {
            state.reader = Some(self.server.take_reader().ok_or_else(|| {
                ProxyError::transport(format!("{}: server reader already taken", self.id))
            })?);
        }
        let timing = self.options.timing;
        let closed = self.server.close_token();
        let mut chunk = vec![0u8; timing.read_buffer.max(1)];

        loop {
            if let Some(response) = self.take_response(&mut state.buffer).await? {
                return Ok(Some(response));
            }

            let deadline = if state.buffer.is_empty() {
                timing.idle
            } else {
                timing.watchdog
            };
            let Some(reader) = state.reader.as_mut() else {
                return Ok(None);
            };
            let read = tokio::select! {
                _ = closed.cancelled() => return Ok(None),
                read = tokio::time::timeout(deadline, reader.read(&mut chunk)) => read,
            };
            match read {
                Err(_) if state.buffer.is_empty() => {
                    return Err(ProxyError::timeout("response", deadline))
                }
                Err(_) => {
                    return Err(ProxyError::Watchdog {
                        buffered: state.buffer.len(),
                        timeout_ms: deadline.as_millis() as u64,
                    })
                }
                Ok(Err(e)) => return Err(ProxyError::transport(e.to_string())),
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => state.buffer.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Consume delimited messages from `buffer` until one yields a response
    async fn take_response(&self, buffer: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        while let Some(len) = self
            .dispatcher
            .boundary(Direction::Server, &buffer[..])?
            .accepted(buffer.len())
        {
            let message = buffer.split_to(len);
            self.dispatcher.chunk_arrived(Direction::Server, &message)?;

            let mut decoded = Vec::new();
            let mut any = false;
            while let Some(unit) = self.dispatcher.available(Direction::Server)? {
                if unit.is_empty() {
                    break;
                }
                any = true;
                decoded.extend(self.dispatcher.received(Direction::Server, unit).await?);
            }
            if any {
                return Ok(Some(self.dispatcher.send(Direction::Server, decoded).await?));
            }
        }
        Ok(None)
    }

    /// Forced client-side send: re-encode `data` as a new request and write it
    pub async fn send_to_server(&self, data: Vec<u8>) -> Result<()> {
        let encoded = self.dispatcher.send_forced(Direction::Client, data).await?;
        self.server.writer().write_all(&encoded).await
    }

    /// Forced server-side send: re-encode `data` as a new response and write it
    pub async fn send_to_client(&self, data: Vec<u8>) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ProxyError::unsupported("send_to_client without a client side"))?;
        let encoded = self.dispatcher.send_forced(Direction::Server, data).await?;
        client.writer().write_all(&encoded).await
    }

    /// Stop the engines and close both endpoints
    pub async fn close(&self) {
        self.control.close();
        if let Some(client) = &self.client {
            client.close().await;
        }
        self.server.close().await;
        if self.strategy == Strategy::Synchronous || !self.started.load(Ordering::SeqCst) {
            self.mark_finished();
        }
        info!("Session {} closed", self.id);
    }

    /// Stop the engines, leaving both endpoints open for another session
    pub fn finish_without_close(&self) {
        self.control.finish_without_close();
    }
}

/// Drain server-to-client output through the flow-control hook into the client
async fn flow_task(
    id: ConnectionId,
    mut rx: mpsc::Receiver<Vec<u8>>,
    dispatcher: Arc<Dispatcher>,
    client: Arc<Endpoint>,
    server: Arc<Endpoint>,
) {
    let writer = client.writer();
    let mut aborted = false;
    while let Some(data) = rx.recv().await {
        let out = match dispatcher.flow_control(Direction::Server, &data) {
            Ok(out) => out,
            Err(e) => {
                error!("{}: flow control hook failed: {}", id, e);
                aborted = true;
                break;
            }
        };
        if let Err(e) = writer.write_all(&out).await {
            warn!("{}: write to client failed: {}", id, e);
            aborted = true;
            break;
        }
    }
    if aborted {
        client.close().await;
        server.close().await;
    }
}

#[cfg(test)]
mod tests;
