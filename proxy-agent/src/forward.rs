//! Plain TCP forward listener
//!
//! Every accepted connection is piped to the listener's configured upstream
//! through a continuous session carrying the full interception pipeline.

use proxy_common::ListenerId;
use proxy_core::{
    assemble_intercept, ConnectionRegistry, Endpoint, ListenerConfig, PipelineContext, ProxyError,
    Session,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ForwardListener {
    listener: TcpListener,
    forwarder: Forwarder,
}

/// Per-connection wiring shared by every accepted client
#[derive(Clone)]
struct Forwarder {
    id: ListenerId,
    config: Arc<ListenerConfig>,
    ctx: PipelineContext,
    registry: Arc<ConnectionRegistry>,
    connect_timeout: Duration,
}

impl ForwardListener {
    pub async fn bind(
        config: ListenerConfig,
        ctx: PipelineContext,
        registry: Arc<ConnectionRegistry>,
        connect_timeout: Duration,
    ) -> proxy_core::Result<Self> {
        if !ctx.codecs.contains(&config.codec) {
            return Err(ProxyError::UnknownCodec {
                name: config.codec.clone(),
            });
        }
        let addr = format!("{}:{}", config.listen_address, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::transport(format!("Failed to bind {}: {}", addr, e)))?;
        let id = ListenerId(listener.local_addr()?.port());
        info!(
            "🚀 Listening on {} -> {} ({} codec)",
            listener.local_addr()?,
            config.upstream,
            config.codec
        );
        Ok(Self {
            listener,
            forwarder: Forwarder {
                id,
                config: Arc::new(config),
                ctx,
                registry,
                connect_timeout,
            },
        })
    }

    pub fn id(&self) -> ListenerId {
        self.forwarder.id
    }

    pub fn local_addr(&self) -> proxy_core::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires, then close every session of this listener
    pub async fn run(self, shutdown: CancellationToken) {
        let id = self.id();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let forwarder = self.forwarder.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forwarder.handle(stream, peer).await {
                                warn!("{}: dropping connection from {}: {}", forwarder.id, peer, e);
                            }
                        });
                    }
                    Err(e) => error!("{}: accept failed: {}", id, e),
                },
            }
        }
        self.forwarder.registry.close_and_clear(id).await;
        info!("{} stopped", id);
    }
}

impl Forwarder {
    async fn handle(&self, client: TcpStream, peer: SocketAddr) -> proxy_core::Result<()> {
        debug!("{}: accepted {}", self.id, peer);
        let upstream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.config.upstream),
        )
        .await
        .map_err(|_| ProxyError::timeout("upstream connect", self.connect_timeout))?
        .map_err(|e| {
            ProxyError::transport(format!("connect to {} failed: {}", self.config.upstream, e))
        })?;

        let server_name = upstream_host(&self.config.upstream);
        let server = Endpoint::from_tcp(upstream, server_name)?
            .with_alpn(self.config.alpn.clone());
        let session = Session::continuous(
            Arc::new(Endpoint::from_tcp(client, peer.to_string())?),
            Arc::new(server),
            self.ctx.session_options().with_listener(self.id),
        );
        assemble_intercept(
            &self.ctx,
            &session,
            &self.config.codec,
            self.config.alpn.as_deref(),
        )?;
        self.registry.register(session.clone());
        session.start()?;

        let registry = self.registry.clone();
        tokio::spawn(async move {
            session.closed().await;
            registry.deregister(session.id());
        });
        Ok(())
    }
}

/// Host part of a `host:port` upstream
fn upstream_host(upstream: &str) -> String {
    match upstream.rsplit_once(':') {
        Some((host, _)) => host.trim_matches(|c| c == '[' || c == ']').to_string(),
        None => upstream.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_host() {
        assert_eq!(upstream_host("example.test:80"), "example.test");
        assert_eq!(upstream_host("[::1]:8080"), "::1");
        assert_eq!(upstream_host("localhost"), "localhost");
    }
}
