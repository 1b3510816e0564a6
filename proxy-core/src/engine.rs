//! Unidirectional stream engine
//!
//! A [`StreamEngine`] owns the readable half of one endpoint. It accumulates
//! reads in a buffer, asks its hooks where the next message ends, and pushes
//! each delimited message through the chunk hooks (arrived, pass-through,
//! available) and then received/send before delivering it to its sink.
//! Messages are handled strictly one at a time in arrival order.

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec::Boundary;
use crate::config::PipelineConfig;
use crate::error::ProxyError;
use crate::transport::{BoxedReader, Endpoint, SharedWriter};
use crate::Result;

/// Hook chain driven by one engine
#[async_trait]
pub trait EngineHooks: Send + Sync {
    fn boundary(&self, data: &[u8]) -> Result<Boundary>;
    fn chunk_arrived(&self, data: &[u8]) -> Result<()>;
    fn pass_through(&self) -> Result<Option<Vec<u8>>>;
    fn available(&self) -> Result<Option<Vec<u8>>>;
    /// Decode and review one logical message. Empty output drops it.
    async fn received(&self, data: Vec<u8>) -> Result<Vec<u8>>;
    /// Encode one approved message for the wire
    async fn send(&self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// Where an engine delivers its output
#[derive(Clone)]
pub enum Sink {
    Writer(SharedWriter),
    /// Secondary channel drained by a flow-control task
    Flow(mpsc::Sender<Vec<u8>>),
}

impl Sink {
    pub async fn deliver(&self, data: Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            Sink::Writer(writer) => writer.write_all(&data).await,
            Sink::Flow(tx) => tx
                .send(data)
                .await
                .map_err(|_| ProxyError::transport("flow control channel closed")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    /// Read deadline while undelimited bytes are buffered
    pub watchdog: Duration,
    /// Read deadline while the buffer is empty
    pub idle: Duration,
    pub read_buffer: usize,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for EngineTiming {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            watchdog: config.watchdog_timeout(),
            idle: config.idle_timeout(),
            read_buffer: config.read_buffer_size,
        }
    }
}

/// Stop signal and close-on-exit flag shared by a session and its engines
#[derive(Debug)]
pub struct EngineControl {
    cancel: CancellationToken,
    close_on_exit: AtomicBool,
}

impl Default for EngineControl {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            close_on_exit: AtomicBool::new(true),
        }
    }

    /// Stop the engines and close the endpoints behind them
    pub fn close(&self) {
        self.close_on_exit.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Stop the engines but leave the endpoints open for another session
    pub fn finish_without_close(&self) {
        self.close_on_exit.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn close_on_exit(&self) -> bool {
        self.close_on_exit.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Why an engine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    EndOfStream,
    Cancelled,
    /// Nothing buffered and nothing read for the idle deadline
    IdleTimeout,
    /// Bytes sat undelimited past the watchdog deadline
    Watchdog { buffered: usize },
    TransportFault(String),
    /// A codec or hook failed on a message
    HookFault(String),
}

impl EngineOutcome {
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            EngineOutcome::Watchdog { .. }
                | EngineOutcome::TransportFault(_)
                | EngineOutcome::HookFault(_)
        )
    }
}

pub struct StreamEngine {
    label: String,
    reader: BoxedReader,
    input_closed: CancellationToken,
    sink: Sink,
    hooks: Arc<dyn EngineHooks>,
    control: Arc<EngineControl>,
    ends: Vec<Arc<Endpoint>>,
    timing: EngineTiming,
}

impl StreamEngine {
    /// Engine reading `input`. Fails if the input's reader was already taken.
    pub fn new(
        label: impl Into<String>,
        input: &Arc<Endpoint>,
        sink: Sink,
        hooks: Arc<dyn EngineHooks>,
        control: Arc<EngineControl>,
        timing: EngineTiming,
    ) -> Result<Self> {
        let label = label.into();
        let reader = input.take_reader().ok_or_else(|| {
            ProxyError::transport(format!("{}: input already has a reader", label))
        })?;
        Ok(Self {
            label,
            reader,
            input_closed: input.close_token(),
            sink,
            hooks,
            control,
            ends: vec![input.clone()],
            timing,
        })
    }

    /// Also close `end` when this engine exits
    pub fn closing(mut self, end: Arc<Endpoint>) -> Self {
        self.ends.push(end);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Pump until end of stream, cancellation or a fault
    pub async fn run(mut self) -> EngineOutcome {
        let outcome = self.pump().await;
        match &outcome {
            EngineOutcome::EndOfStream | EngineOutcome::Cancelled => {
                debug!("{}: stopped ({:?})", self.label, outcome)
            }
            EngineOutcome::IdleTimeout => {
                debug!("{}: idle for {:?}, closing", self.label, self.timing.idle)
            }
            EngineOutcome::Watchdog { buffered } => error!(
                "{}: {} bytes undelimited for {:?}, forcing close",
                self.label, buffered, self.timing.watchdog
            ),
            EngineOutcome::TransportFault(reason) => {
                warn!("{}: transport fault: {}", self.label, reason)
            }
            EngineOutcome::HookFault(reason) => {
                error!("{}: hook fault: {}", self.label, reason)
            }
        }

        if self.control.close_on_exit() {
            for end in &self.ends {
                end.close().await;
            }
        }
        outcome
    }

    async fn pump(&mut self) -> EngineOutcome {
        let mut buffer = BytesMut::with_capacity(self.timing.read_buffer);
        let mut chunk = vec![0u8; self.timing.read_buffer.max(1)];
        let stop = self.control.token();

        loop {
            let deadline = if buffer.is_empty() {
                self.timing.idle
            } else {
                self.timing.watchdog
            };
            let read = tokio::select! {
                _ = stop.cancelled() => return EngineOutcome::Cancelled,
                _ = self.input_closed.cancelled() => return EngineOutcome::Cancelled,
                read = tokio::time::timeout(deadline, self.reader.read(&mut chunk)) => read,
            };

            let n = match read {
                Err(_) if buffer.is_empty() => return EngineOutcome::IdleTimeout,
                Err(_) => {
                    return EngineOutcome::Watchdog {
                        buffered: buffer.len(),
                    }
                }
                Ok(Err(e)) => return EngineOutcome::TransportFault(e.to_string()),
                Ok(Ok(0)) => return EngineOutcome::EndOfStream,
                Ok(Ok(n)) => n,
            };
            buffer.extend_from_slice(&chunk[..n]);

            if let Err(e) = self.dispatch(&mut buffer).await {
                return if e.is_transport_fault() {
                    EngineOutcome::TransportFault(e.to_string())
                } else {
                    EngineOutcome::HookFault(e.to_string())
                };
            }
        }
    }

    /// Consume every complete message at the front of `buffer`
    async fn dispatch(&mut self, buffer: &mut BytesMut) -> Result<()> {
        while !buffer.is_empty() {
            let Some(len) = self.hooks.boundary(&buffer[..])?.accepted(buffer.len()) else {
                break;
            };
            let message = buffer.split_to(len);
            self.hooks.chunk_arrived(&message)?;

            while let Some(pass) = self.hooks.pass_through()? {
                if pass.is_empty() {
                    break;
                }
                self.sink.deliver(pass).await?;
            }

            while let Some(unit) = self.hooks.available()? {
                if unit.is_empty() {
                    break;
                }
                let approved = self.hooks.received(unit).await?;
                if approved.is_empty() {
                    debug!("{}: message dropped", self.label);
                    continue;
                }
                let encoded = self.hooks.send(approved).await?;
                self.sink.deliver(encoded).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};

    /// 4-byte big-endian length header followed by that many body bytes
    #[derive(Default)]
    struct LengthPrefixed {
        pending: Mutex<Vec<Vec<u8>>>,
        pass: Mutex<VecDeque<Vec<u8>>>,
        drop_marker: Option<u8>,
    }

    #[async_trait]
    impl EngineHooks for LengthPrefixed {
        fn boundary(&self, data: &[u8]) -> Result<Boundary> {
            if data.len() < 4 {
                return Ok(Boundary::Incomplete);
            }
            let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            Ok(Boundary::Complete(4 + len))
        }

        fn chunk_arrived(&self, data: &[u8]) -> Result<()> {
            self.pending.lock().push(data.to_vec());
            Ok(())
        }

        fn pass_through(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.pass.lock().pop_front())
        }

        fn available(&self) -> Result<Option<Vec<u8>>> {
            let mut pending = self.pending.lock();
            Ok(if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            })
        }

        async fn received(&self, data: Vec<u8>) -> Result<Vec<u8>> {
            if self.drop_marker.is_some() && data.last() == self.drop_marker.as_ref() {
                return Ok(Vec::new());
            }
            Ok(data)
        }

        async fn send(&self, data: Vec<u8>) -> Result<Vec<u8>> {
            Ok(data)
        }
    }

    /// Yields one scripted fragment per read, then end of stream
    struct Fragments(VecDeque<Vec<u8>>);

    impl AsyncRead for Fragments {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if let Some(mut next) = self.0.pop_front() {
                let take = next.len().min(buf.remaining());
                buf.put_slice(&next[..take]);
                if take < next.len() {
                    self.0.push_front(next.split_off(take));
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn addr() -> std::net::SocketAddr {
        "127.0.0.1:7".parse().unwrap()
    }

    fn scripted(fragments: Vec<Vec<u8>>) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            addr(),
            "scripted",
            Fragments(fragments.into()),
            tokio::io::sink(),
        ))
    }

    async fn collect(
        input: Arc<Endpoint>,
        hooks: Arc<dyn EngineHooks>,
        timing: EngineTiming,
    ) -> (EngineOutcome, Vec<Vec<u8>>) {
        let (tx, mut rx) = mpsc::channel(64);
        let engine = StreamEngine::new(
            "test",
            &input,
            Sink::Flow(tx),
            hooks,
            Arc::new(EngineControl::new()),
            timing,
        )
        .unwrap();
        let outcome = engine.run().await;
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        (outcome, out)
    }

    fn split_at_points(data: &[u8], mut points: Vec<usize>) -> Vec<Vec<u8>> {
        points.retain(|&p| p > 0 && p < data.len());
        points.sort_unstable();
        points.dedup();
        let mut fragments = Vec::new();
        let mut start = 0;
        for p in points {
            fragments.push(data[start..p].to_vec());
            start = p;
        }
        fragments.push(data[start..].to_vec());
        fragments
    }

    proptest! {
        #[test]
        fn prop_fragmentation_does_not_change_messages(
            body in proptest::collection::vec(any::<u8>(), 0..512),
            points in proptest::collection::vec(0usize..600, 0..12),
        ) {
            let message = framed(&body);
            let fragments = split_at_points(&message, points);
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (outcome, out) = rt.block_on(collect(
                scripted(fragments),
                Arc::new(LengthPrefixed::default()),
                EngineTiming::default(),
            ));
            prop_assert_eq!(outcome, EngineOutcome::EndOfStream);
            prop_assert_eq!(out, vec![message]);
        }
    }

    #[tokio::test]
    async fn test_back_to_back_messages_stay_ordered() {
        let mut stream = framed(b"first");
        stream.extend(framed(b"second"));
        stream.extend(framed(b"third"));
        let fragments = vec![stream[..7].to_vec(), stream[7..].to_vec()];

        let (_, out) = collect(
            scripted(fragments),
            Arc::new(LengthPrefixed::default()),
            EngineTiming::default(),
        )
        .await;
        assert_eq!(out, vec![framed(b"first"), framed(b"second"), framed(b"third")]);
    }

    #[tokio::test]
    async fn test_pass_through_goes_first_and_drops_are_skipped() {
        let hooks = LengthPrefixed {
            drop_marker: Some(b'!'),
            ..Default::default()
        };
        hooks.pass.lock().push_back(b"ping".to_vec());

        let mut stream = framed(b"keep");
        stream.extend(framed(b"drop!"));
        let (_, out) = collect(scripted(vec![stream]), Arc::new(hooks), EngineTiming::default()).await;
        assert_eq!(out, vec![b"ping".to_vec(), framed(b"keep")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_stalled_input() {
        let (endpoint, mut peer) = Endpoint::in_memory(addr(), "stalled", 64);
        let input = Arc::new(endpoint);
        peer.write_all(&[0, 0]).await.unwrap();

        let timing = EngineTiming {
            watchdog: Duration::from_secs(30),
            idle: Duration::from_secs(86_400),
            read_buffer: 1024,
        };
        let (outcome, out) = collect(input.clone(), Arc::new(LengthPrefixed::default()), timing).await;
        assert_eq!(outcome, EngineOutcome::Watchdog { buffered: 2 });
        assert!(out.is_empty());
        assert!(input.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_uses_idle_deadline() {
        let (endpoint, _peer) = Endpoint::in_memory(addr(), "idle", 64);
        let input = Arc::new(endpoint);
        let timing = EngineTiming {
            watchdog: Duration::from_secs(30),
            idle: Duration::from_secs(86_400),
            read_buffer: 1024,
        };

        let started = tokio::time::Instant::now();
        let (outcome, _) = collect(input, Arc::new(LengthPrefixed::default()), timing).await;
        assert_eq!(outcome, EngineOutcome::IdleTimeout);
        assert!(started.elapsed() >= Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_finish_without_close_leaves_endpoints_open() {
        let (endpoint, _peer) = Endpoint::in_memory(addr(), "handoff", 64);
        let input = Arc::new(endpoint);
        let control = Arc::new(EngineControl::new());
        let (tx, _rx) = mpsc::channel(4);
        let engine = StreamEngine::new(
            "handoff",
            &input,
            Sink::Flow(tx),
            Arc::new(LengthPrefixed::default()),
            control.clone(),
            EngineTiming::default(),
        )
        .unwrap();

        let task = tokio::spawn(engine.run());
        control.finish_without_close();
        assert_eq!(task.await.unwrap(), EngineOutcome::Cancelled);
        assert!(!input.is_closed());
    }

    #[tokio::test]
    async fn test_reader_cannot_be_shared() {
        let input = scripted(vec![]);
        let (tx, _rx) = mpsc::channel(1);
        let control = Arc::new(EngineControl::new());
        let hooks: Arc<dyn EngineHooks> = Arc::new(LengthPrefixed::default());
        let first = StreamEngine::new(
            "a",
            &input,
            Sink::Flow(tx.clone()),
            hooks.clone(),
            control.clone(),
            EngineTiming::default(),
        );
        assert!(first.is_ok());
        let second = StreamEngine::new(
            "b",
            &input,
            Sink::Flow(tx),
            hooks,
            control,
            EngineTiming::default(),
        );
        assert!(second.is_err());
    }

    fn assert_send<T: Send>(_: T) {}

    #[test]
    fn test_engine_future_is_send() {
        let (endpoint, _peer) = Endpoint::in_memory(addr(), "spawned", 64);
        let input = Arc::new(endpoint);
        let (tx, _rx) = mpsc::channel(1);
        let engine = StreamEngine::new(
            "spawned",
            &input,
            Sink::Flow(tx),
            Arc::new(LengthPrefixed::default()),
            Arc::new(EngineControl::new()),
            EngineTiming::default(),
        )
        .unwrap();
        assert_send(engine.run());
    }
}
