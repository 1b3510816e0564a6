//! Proxy Agent
//!
//! Standalone executable that pipes plain TCP listeners through the session
//! pipeline and exposes the operator API.

use anyhow::Context;
use clap::Parser;
use proxy_core::{
    admin::AdminState, start_admin_server, CodecRegistry, ConnectionRegistry, ListenerConfig,
    PipelineContext, ProxyConfig, ReplayController, Resender, TcpDialer,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod forward;
pub mod logging;

use forward::ForwardListener;

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port of an additional forward listener (requires --upstream)
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// `host:port` the --listen-port listener pipes to
    #[arg(long)]
    pub upstream: Option<String>,

    /// Codec for the --listen-port listener
    #[arg(long)]
    pub codec: Option<String>,

    /// Port to expose the Admin API
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Directory of codec plugin descriptors
    #[arg(long)]
    pub plugin_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON log lines
    #[arg(long)]
    pub log_json: bool,

    /// Also write logs to this file (rotated daily)
    #[arg(long)]
    pub log_file: Option<String>,

    /// Start with interception armed
    #[arg(long)]
    pub intercept: bool,
}

impl Args {
    pub fn logging_config(&self) -> logging::LoggingConfig {
        logging::LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.log_json,
            log_file: self.log_file.clone(),
            ..Default::default()
        }
    }
}

/// Load the file configuration (if any) and apply CLI overrides
pub fn load_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    if let Some(port) = args.admin_port {
        config.admin_port = Some(port);
    }
    if let Some(dir) = &args.plugin_dir {
        config.plugin_dir = Some(dir.clone());
    }
    if args.intercept {
        config.intercept.armed = true;
    }

    match (args.listen_port, &args.upstream) {
        (Some(port), Some(upstream)) => {
            let mut listener = ListenerConfig {
                listen_address: "127.0.0.1".to_string(),
                listen_port: port,
                upstream: upstream.clone(),
                codec: "Sample".to_string(),
                alpn: None,
            };
            if let Some(codec) = &args.codec {
                listener.codec = codec.clone();
            }
            config.listeners.push(listener);
        }
        (Some(_), None) => anyhow::bail!("--listen-port requires --upstream"),
        (None, Some(_)) => anyhow::bail!("--upstream requires --listen-port"),
        (None, None) => {
            if let Some(codec) = &args.codec {
                for listener in &mut config.listeners {
                    listener.codec = codec.clone();
                }
            }
        }
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// A running agent: listeners, shared pipeline state and the admin API
pub struct Agent {
    pub ctx: PipelineContext,
    pub registry: Arc<ConnectionRegistry>,
    pub replay: Arc<ReplayController>,
    listeners: Vec<(SocketAddr, JoinHandle<()>)>,
    admin: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Agent {
    pub async fn start(config: ProxyConfig) -> anyhow::Result<Self> {
        let codecs = Arc::new(CodecRegistry::with_builtin());
        if let Some(dir) = &config.plugin_dir {
            let loaded = codecs
                .load_plugin_dir(dir)
                .with_context(|| format!("loading plugins from {}", dir.display()))?;
            tracing::info!("Loaded {} codec plugin(s) from {}", loaded, dir.display());
        }

        let ctx = PipelineContext::new(&config, codecs);
        let registry = Arc::new(ConnectionRegistry::new());
        let replay = Arc::new(ReplayController::new(
            ctx.clone(),
            registry.clone(),
            Arc::new(TcpDialer::new(config.replay.connect_timeout())),
            &config.replay,
        ));
        let resender: Arc<dyn Resender> = replay.clone();
        ctx.gate.set_resender(Arc::downgrade(&resender));

        let shutdown = CancellationToken::new();
        let mut listeners = Vec::new();
        for listener_config in &config.listeners {
            let listener = ForwardListener::bind(
                listener_config.clone(),
                ctx.clone(),
                registry.clone(),
                config.replay.connect_timeout(),
            )
            .await
            .with_context(|| {
                format!("starting listener on port {}", listener_config.listen_port)
            })?;
            let addr = listener.local_addr()?;
            let handle = tokio::spawn(listener.run(shutdown.child_token()));
            listeners.push((addr, handle));
        }

        let admin = config.admin_port.map(|port| {
            let state = AdminState {
                ctx: ctx.clone(),
                registry: registry.clone(),
                replay: replay.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = start_admin_server(port, state).await {
                    tracing::error!("Admin API failed: {}", e);
                }
            })
        });

        tracing::info!(
            "Agent started: {} listener(s), intercept {}",
            listeners.len(),
            if ctx.gate.is_armed() { "armed" } else { "off" }
        );

        Ok(Self {
            ctx,
            registry,
            replay,
            listeners,
            admin,
            shutdown,
        })
    }

    /// Bound addresses of the forward listeners, in configuration order
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|(addr, _)| *addr).collect()
    }

    /// Stop accepting, close every live session and stop the admin API
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        // a review in progress would otherwise hold its session open
        self.ctx.gate.disable_intercept_mode(None);
        for (addr, handle) in self.listeners {
            if let Err(e) = handle.await {
                tracing::warn!("Listener {} ended abnormally: {}", addr, e);
            }
        }
        if let Some(admin) = self.admin {
            admin.abort();
        }
        tracing::info!("Agent stopped");
    }
}
