//! Transport endpoints
//!
//! An [`Endpoint`] is one side of a proxied connection: a readable half that
//! exactly one reader may take, a writable half that any number of sessions
//! may share, and a close token that wakes blocked readers. Plain sockets,
//! TLS streams and in-memory pipes all fit behind it.

use async_trait::async_trait;
use parking_lot::Mutex;
use proxy_common::Addressing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProxyError;
use crate::Result;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writable half shared between a session and its replay siblings
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<tokio::sync::Mutex<BoxedWriter>>,
    closed: CancellationToken,
}

impl SharedWriter {
    /// `closed` aborts in-flight writes so a peer that stopped reading can
    /// never keep the endpoint from closing
    pub fn new(writer: BoxedWriter, closed: CancellationToken) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(writer)),
            closed,
        }
    }

    /// Write and flush. Concurrent writers never interleave within one call.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                Err(ProxyError::transport("write aborted: endpoint closed"))
            }
            written = self.write_locked(data) => written,
        }
    }

    async fn write_locked(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| ProxyError::transport(format!("write failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ProxyError::transport(format!("flush failed: {}", e)))
    }

    pub async fn shutdown(&self) {
        let mut writer = self.inner.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("shutdown on closed writer: {}", e);
        }
    }
}

pub struct Endpoint {
    address: SocketAddr,
    name: String,
    alpn: Option<String>,
    tls: bool,
    reader: Mutex<Option<BoxedReader>>,
    writer: SharedWriter,
    closed: CancellationToken,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("alpn", &self.alpn)
            .field("tls", &self.tls)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Endpoint {
    pub fn new<R, W>(address: SocketAddr, name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let closed = CancellationToken::new();
        Self {
            address,
            name: name.into(),
            alpn: None,
            tls: false,
            reader: Mutex::new(Some(Box::new(reader))),
            writer: SharedWriter::new(Box::new(writer), closed.clone()),
            closed,
        }
    }

    pub fn from_tcp(stream: TcpStream, name: impl Into<String>) -> Result<Self> {
        let address = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(address, name, reader, writer))
    }

    /// In-memory endpoint plus the peer end of its pipe
    pub fn in_memory(
        address: SocketAddr,
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, DuplexStream) {
        let (local, peer) = tokio::io::duplex(capacity);
        let (reader, writer) = tokio::io::split(local);
        (Self::new(address, name, reader, writer), peer)
    }

    pub fn with_alpn(mut self, alpn: Option<String>) -> Self {
        self.alpn = alpn;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn application_protocol(&self) -> Option<&str> {
        self.alpn.as_deref()
    }

    /// Hand the readable half to its single consumer
    pub fn take_reader(&self) -> Option<BoxedReader> {
        self.reader.lock().take()
    }

    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wake blocked readers and shut the write half down. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.writer.shutdown().await;
        debug!("closed endpoint {} ({})", self.name, self.address);
    }
}

/// Opens fresh server-side endpoints for replays that need a new connection
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Addressing, alpn: Option<&str>) -> Result<Endpoint>;
}

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &Addressing, alpn: Option<&str>) -> Result<Endpoint> {
        if target.tls {
            return Err(ProxyError::unsupported(format!(
                "TLS dial to {} needs a TLS-capable dialer",
                target.server_name
            )));
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target.server))
            .await
            .map_err(|_| ProxyError::timeout("connect", self.connect_timeout))?
            .map_err(|e| {
                ProxyError::transport(format!("connect to {} failed: {}", target.server, e))
            })?;
        debug!("dialed {} for replay", target.server);
        Ok(Endpoint::from_tcp(stream, target.server_name.clone())?
            .with_alpn(alpn.map(str::to_string)))
    }
}
