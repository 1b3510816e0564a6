//! Pipeline assembly
//!
//! Builds the hook sets sessions run:
//!
//! - [`InterceptHooks`]: decode, modification rules, the intercept gate,
//!   re-encode, and a history record at every stage. Installed on every
//!   accepted connection.
//! - [`ReplayHooks`]: decode and encode only. Used by replay, either on a
//!   freshly dialed synchronous session or on a sibling of a live session
//!   sharing its transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use proxy_common::{Addressing, ConnectionId, Direction, Exchange, GroupId, Snapshot};
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::admin::Metrics;
use crate::codec::{Boundary, Codec, CodecRegistry, REDACTED_BODY_NOTE};
use crate::config::{PipelineConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::gate::InterceptGate;
use crate::history::HistoryStore;
use crate::policy::ModificationRules;
use crate::session::{Session, SessionHooks, SessionOptions};
use crate::transport::Endpoint;
use crate::Result;

/// Shared services every pipeline is wired to
#[derive(Clone)]
pub struct PipelineContext {
    pub history: Arc<HistoryStore>,
    pub gate: Arc<InterceptGate>,
    pub rules: Arc<ModificationRules>,
    pub codecs: Arc<CodecRegistry>,
    pub metrics: Arc<Metrics>,
    pub pipeline: PipelineConfig,
}

impl PipelineContext {
    pub fn new(config: &ProxyConfig, codecs: Arc<CodecRegistry>) -> Self {
        let metrics = Arc::new(Metrics::default());
        let gate = InterceptGate::new(&config.intercept).with_metrics(metrics.clone());
        Self {
            history: Arc::new(HistoryStore::new()),
            gate: Arc::new(gate),
            rules: Arc::new(ModificationRules::new()),
            codecs,
            metrics,
            pipeline: config.pipeline.clone(),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::from(&self.pipeline).with_metrics(self.metrics.clone())
    }

    fn recorder(&self) -> Recorder {
        Recorder {
            history: self.history.clone(),
            metrics: self.metrics.clone(),
            threshold: self.pipeline.record_every_stage_below,
        }
    }
}

/// Writes exchanges to history. Exchanges under the threshold are written at
/// every stage; larger ones only when complete.
#[derive(Clone)]
struct Recorder {
    history: Arc<HistoryStore>,
    metrics: Arc<Metrics>,
    threshold: usize,
}

impl Recorder {
    fn write(&self, exchange: &mut Exchange) -> Result<()> {
        if exchange.is_recorded() {
            self.history.update(exchange)
        } else {
            self.history.insert(exchange);
            self.metrics.exchanges_recorded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn stage(&self, exchange: &mut Exchange) -> Result<()> {
        if exchange.payload_len() < self.threshold {
            self.write(exchange)
        } else {
            Ok(())
        }
    }

    fn complete(&self, exchange: &mut Exchange) -> Result<()> {
        self.write(exchange)
    }
}

fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn is_image(content_type: &str) -> bool {
    content_type.trim().to_ascii_lowercase().starts_with("image/")
}

/// In-flight request and response of one connection
#[derive(Default)]
struct PairState {
    request: Option<Exchange>,
    response: Option<Exchange>,
}

struct Wiring {
    codec: Arc<dyn Codec>,
    addressing: Addressing,
    alpn: Option<String>,
    conn: ConnectionId,
}

impl Wiring {
    fn exchange(&self, direction: Direction, group: GroupId) -> Exchange {
        Exchange::new(
            direction,
            self.addressing.clone(),
            self.codec.name(),
            self.alpn.clone(),
            self.conn,
            group,
        )
    }

    fn boundary(&self, direction: Direction, data: &[u8]) -> Boundary {
        match direction {
            Direction::Client => self.codec.check_request_delimiter(data),
            Direction::Server => self.codec.check_response_delimiter(data),
        }
    }
}

/// Full interception pipeline of one accepted connection
pub struct InterceptHooks {
    wiring: Wiring,
    gate: Arc<InterceptGate>,
    rules: Arc<ModificationRules>,
    history: Arc<HistoryStore>,
    recorder: Recorder,
    state: Mutex<PairState>,
}

impl InterceptHooks {
    fn new(ctx: &PipelineContext, wiring: Wiring) -> Self {
        Self {
            wiring,
            gate: ctx.gate.clone(),
            rules: ctx.rules.clone(),
            history: ctx.history.clone(),
            recorder: ctx.recorder(),
            state: Mutex::new(PairState::default()),
        }
    }

    fn current_request(&self) -> Option<Exchange> {
        self.state.lock().request.clone()
    }

    /// Gate `rule_modified` and fold the verdict into `exchange`
    async fn review(
        &self,
        exchange: &mut Exchange,
        request: Option<&Exchange>,
    ) -> Result<Vec<u8>> {
        let rule_modified = exchange.rule_modified.clone();
        let outcome = self
            .gate
            .received(rule_modified.clone(), exchange, request)
            .await;

        let multiplied = outcome.was_multiplied();
        let data = outcome.into_data();
        // Dropped, or released with nothing left to send
        if data.is_empty() {
            debug!("{} dropped, nothing to send", exchange.id);
            exchange.modified = true;
            exchange.modified_data = Vec::new();
            self.recorder.complete(exchange)?;
            return Ok(Vec::new());
        }
        if multiplied {
            exchange.resend = true;
        }
        if digest(&data) != digest(&rule_modified) {
            exchange.modified = true;
        }
        exchange.modified_data = data.clone();
        self.recorder.stage(exchange)?;
        Ok(data)
    }

    async fn client_received(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut request = self
            .wiring
            .exchange(Direction::Client, self.history.next_group());
        request.received = data;
        self.recorder.stage(&mut request)?;

        request.decoded = self.wiring.codec.decode_client_request(&request)?;
        self.wiring.codec.assign_group(&mut request);
        self.recorder.stage(&mut request)?;

        let server = request.addressing.server_name.clone();
        let decoded = request.decoded.clone();
        request.rule_modified = self.rules.replace_on_request(&decoded, &server, &mut request);
        self.recorder.stage(&mut request)?;

        let out = self.review(&mut request, None).await?;
        self.state.lock().request = Some(request);
        Ok(out)
    }

    async fn server_received(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let request = self.current_request();
        let group = match &request {
            Some(req) => req.group,
            None => self.history.next_group(),
        };
        let mut response = self.wiring.exchange(Direction::Server, group);
        response.received = data;
        self.recorder.stage(&mut response)?;

        response.decoded = self
            .wiring
            .codec
            .decode_server_response(request.as_ref(), &response)?;
        self.wiring.codec.assign_group(&mut response);
        response.content_type = self.wiring.codec.content_type(request.as_ref(), &response);
        self.recorder.stage(&mut response)?;
        self.propagate_content_type(&response)?;

        let server = response.addressing.server_name.clone();
        let decoded = response.decoded.clone();
        response.rule_modified = self.rules.replace_on_response(&decoded, &server, &mut response);
        self.recorder.stage(&mut response)?;

        let out = self.review(&mut response, request.as_ref()).await?;
        self.state.lock().response = Some(response);
        Ok(out)
    }

    /// Copy a response's content type onto the request sharing its group
    fn propagate_content_type(&self, response: &Exchange) -> Result<()> {
        if response.content_type.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if let Some(req) = state.request.as_mut() {
                if req.group == response.group {
                    req.content_type = response.content_type.clone();
                }
            }
        }
        for mut req in self.history.by_group(response.group) {
            if req.direction == Direction::Client && req.content_type != response.content_type {
                req.content_type = response.content_type.clone();
                self.history.update(&req)?;
            }
        }
        Ok(())
    }

    async fn client_send(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut request = match self.current_request() {
            Some(request) => request,
            None => self
                .wiring
                .exchange(Direction::Client, self.history.next_group()),
        };
        request.modified_data = data;
        let encoded = self.wiring.codec.encode_client_request(&request)?;
        request.sent = encoded.clone();
        self.recorder.complete(&mut request)?;
        self.state.lock().request = Some(request);
        Ok(encoded)
    }

    async fn server_send(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let request = self.current_request();
        let mut response = match self.state.lock().response.take() {
            Some(response) => response,
            None => self.wiring.exchange(
                Direction::Server,
                request.as_ref().map(|r| r.group).unwrap_or_default(),
            ),
        };
        response.modified_data = data;
        let encoded = self
            .wiring
            .codec
            .encode_server_response(request.as_ref(), &response)?;
        response.sent = encoded.clone();
        if is_image(&response.content_type) {
            self.redact(&mut response);
        }
        self.recorder.complete(&mut response)?;
        self.state.lock().response = Some(response);
        Ok(encoded)
    }

    /// Replace the body of every recorded stage with a note
    fn redact(&self, response: &mut Exchange) {
        let codec = &self.wiring.codec;
        response.received = codec.redact_body(&response.received, REDACTED_BODY_NOTE);
        response.decoded = codec.redact_body(&response.decoded, REDACTED_BODY_NOTE);
        response.modified_data = codec.redact_body(&response.modified_data, REDACTED_BODY_NOTE);
        response.sent = codec.redact_body(&response.sent, REDACTED_BODY_NOTE);
    }

    async fn client_send_forced(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut request = self
            .wiring
            .exchange(Direction::Client, self.history.next_group());
        request.modified = true;
        request.decoded = data.clone();
        request.modified_data = data;
        request.modified_data = self.wiring.codec.before_resend_client_request(&request)?;
        let encoded = self.wiring.codec.encode_client_request(&request)?;
        request.sent = encoded.clone();
        self.recorder.complete(&mut request)?;
        self.state.lock().request = Some(request);
        Ok(encoded)
    }

    async fn server_send_forced(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let request = self.current_request();
        let group = match &request {
            Some(req) => req.group,
            None => self.history.next_group(),
        };
        let mut response = self.wiring.exchange(Direction::Server, group);
        response.modified = true;
        response.decoded = data.clone();
        response.modified_data = data;
        response.modified_data = self.wiring.codec.before_resend_server_response(&response)?;
        let encoded = self
            .wiring
            .codec
            .encode_server_response(request.as_ref(), &response)?;
        response.sent = encoded.clone();
        self.recorder.complete(&mut response)?;
        Ok(encoded)
    }
}

#[async_trait]
impl SessionHooks for InterceptHooks {
    fn boundary(&self, direction: Direction, data: &[u8]) -> Result<Boundary> {
        Ok(self.wiring.boundary(direction, data))
    }

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()> {
        self.wiring.codec.chunk_arrived(direction, data)
    }

    fn pass_through(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        self.wiring.codec.pass_through(direction)
    }

    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        self.wiring.codec.available(direction)
    }

    async fn received(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match direction {
            Direction::Client => self.client_received(data).await,
            Direction::Server => self.server_received(data).await,
        }
    }

    async fn send(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match direction {
            Direction::Client => self.client_send(data).await,
            Direction::Server => self.server_send(data).await,
        }
    }

    async fn send_forced(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match direction {
            Direction::Client => self.client_send_forced(data).await,
            Direction::Server => self.server_send_forced(data).await,
        }
    }

    fn flow_control(&self, direction: Direction, data: &[u8]) -> Result<Vec<u8>> {
        self.wiring.codec.flow_control(direction, data)
    }
}

/// Decode/encode-only hooks used by replay. Client input is an already
/// decoded payload; each prepared copy is recorded as a modified request.
pub struct ReplayHooks {
    wiring: Wiring,
    history: Arc<HistoryStore>,
    recorder: Recorder,
    state: Mutex<PairState>,
}

impl ReplayHooks {
    fn new(ctx: &PipelineContext, wiring: Wiring) -> Self {
        Self {
            wiring,
            history: ctx.history.clone(),
            recorder: ctx.recorder(),
            state: Mutex::new(PairState::default()),
        }
    }
}

#[async_trait]
impl SessionHooks for ReplayHooks {
    fn boundary(&self, direction: Direction, data: &[u8]) -> Result<Boundary> {
        Ok(match direction {
            Direction::Client => Boundary::Complete(data.len()),
            Direction::Server => self.wiring.boundary(direction, data),
        })
    }

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()> {
        self.wiring.codec.chunk_arrived(direction, data)
    }

    fn pass_through(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        self.wiring.codec.pass_through(direction)
    }

    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        self.wiring.codec.available(direction)
    }

    async fn received(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match direction {
            Direction::Client => Ok(data),
            Direction::Server => {
                let request = self.state.lock().request.clone();
                let group = match &request {
                    Some(req) => req.group,
                    None => self.history.next_group(),
                };
                let mut response = self.wiring.exchange(Direction::Server, group);
                response.received = data;
                response.decoded = self
                    .wiring
                    .codec
                    .decode_server_response(request.as_ref(), &response)?;
                response.content_type =
                    self.wiring.codec.content_type(request.as_ref(), &response);
                response.modified_data = response.decoded.clone();
                let decoded = response.decoded.clone();
                self.state.lock().response = Some(response);
                Ok(decoded)
            }
        }
    }

    async fn send(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match direction {
            Direction::Client => {
                let mut request = self
                    .wiring
                    .exchange(Direction::Client, self.history.next_group());
                request.modified = true;
                request.decoded = data.clone();
                request.modified_data = data;
                request.modified_data = self.wiring.codec.before_resend_client_request(&request)?;
                let encoded = self.wiring.codec.encode_client_request(&request)?;
                request.sent = encoded.clone();
                self.recorder.complete(&mut request)?;
                self.state.lock().request = Some(request);
                Ok(encoded)
            }
            Direction::Server => {
                let request = self.state.lock().request.clone();
                let Some(mut response) = self.state.lock().response.take() else {
                    return Ok(data);
                };
                response.modified_data = data;
                let encoded = self
                    .wiring
                    .codec
                    .encode_server_response(request.as_ref(), &response)?;
                response.sent = encoded.clone();
                self.recorder.complete(&mut response)?;
                Ok(encoded)
            }
        }
    }

    async fn send_forced(&self, _direction: Direction, _data: Vec<u8>) -> Result<Vec<u8>> {
        Err(ProxyError::unsupported("forced send on a replay session"))
    }

    fn flow_control(&self, direction: Direction, data: &[u8]) -> Result<Vec<u8>> {
        self.wiring.codec.flow_control(direction, data)
    }
}

/// Install the interception pipeline on an accepted session
pub fn assemble_intercept(
    ctx: &PipelineContext,
    session: &Arc<Session>,
    codec_name: &str,
    alpn: Option<&str>,
) -> Result<()> {
    let codec = ctx.codecs.create(codec_name, alpn)?;
    let addressing = session
        .addressing()
        .ok_or_else(|| ProxyError::hook("interception needs a client side"))?;
    let hooks = InterceptHooks::new(
        ctx,
        Wiring {
            codec,
            addressing,
            alpn: alpn.map(str::to_string),
            conn: session.id(),
        },
    );
    session.install_hooks(Arc::new(hooks))
}

/// Synchronous session over a freshly dialed `server` for one replay copy
pub fn assemble_one_shot(
    ctx: &PipelineContext,
    server: Arc<Endpoint>,
    snapshot: &Snapshot,
) -> Result<Arc<Session>> {
    let codec = ctx.codecs.create(&snapshot.codec, snapshot.alpn.as_deref())?;
    let session = Session::synchronous(
        server,
        ctx.session_options()
            .with_listener(snapshot.addressing.listener),
    );
    let hooks = ReplayHooks::new(
        ctx,
        Wiring {
            codec,
            addressing: snapshot.addressing.clone(),
            alpn: snapshot.alpn.clone(),
            conn: session.id(),
        },
    );
    session.install_hooks(Arc::new(hooks))?;
    Ok(session)
}

/// Sibling of `original` sharing its transport, with replay hooks and a
/// fresh codec instance. Records land under the original connection.
pub fn assemble_shared_replay(
    ctx: &PipelineContext,
    original: &Arc<Session>,
    snapshot: &Snapshot,
) -> Result<Arc<Session>> {
    let codec = ctx.codecs.create(&snapshot.codec, snapshot.alpn.as_deref())?;
    let session = original.same_connection();
    let addressing = original
        .addressing()
        .unwrap_or_else(|| snapshot.addressing.clone());
    let hooks = ReplayHooks::new(
        ctx,
        Wiring {
            codec,
            addressing,
            alpn: snapshot.alpn.clone(),
            conn: original.id(),
        },
    );
    session.install_hooks(Arc::new(hooks))?;
    Ok(session)
}
