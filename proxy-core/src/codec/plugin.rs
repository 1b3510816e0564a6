//! Codec plugins from a descriptor directory
//!
//! Each `*.toml` file in the plugin directory declares a codec derived from
//! an already-registered base codec, overriding its name and resend policy:
//!
//! ```toml
//! name = "HTTP-keepalive"
//! base = "HTTP"
//! use_new_connection_for_resend = false
//! ```

use proxy_common::{Direction, Exchange};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Boundary, Codec, CodecRegistry, FrameQueue};
use crate::error::ProxyError;
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub base: String,
    #[serde(default)]
    pub use_new_connection_for_resend: Option<bool>,
    #[serde(default)]
    pub use_new_codec_for_resend: Option<bool>,
}

/// Base codec with an overridden name and resend policy
pub struct PluginCodec {
    name: String,
    base: Arc<dyn Codec>,
    new_connection: Option<bool>,
    new_codec: Option<bool>,
}

impl PluginCodec {
    pub fn new(descriptor: &PluginDescriptor, base: Arc<dyn Codec>) -> Self {
        Self {
            name: descriptor.name.clone(),
            base,
            new_connection: descriptor.use_new_connection_for_resend,
            new_codec: descriptor.use_new_codec_for_resend,
        }
    }
}

impl Codec for PluginCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_delimiter(&self, data: &[u8]) -> Boundary {
        self.base.check_delimiter(data)
    }

    fn frames(&self) -> &FrameQueue {
        self.base.frames()
    }

    fn check_request_delimiter(&self, data: &[u8]) -> Boundary {
        self.base.check_request_delimiter(data)
    }

    fn check_response_delimiter(&self, data: &[u8]) -> Boundary {
        self.base.check_response_delimiter(data)
    }

    fn decode_client_request(&self, request: &Exchange) -> Result<Vec<u8>> {
        self.base.decode_client_request(request)
    }

    fn encode_client_request(&self, request: &Exchange) -> Result<Vec<u8>> {
        self.base.encode_client_request(request)
    }

    fn decode_server_response(
        &self,
        request: Option<&Exchange>,
        response: &Exchange,
    ) -> Result<Vec<u8>> {
        self.base.decode_server_response(request, response)
    }

    fn encode_server_response(
        &self,
        request: Option<&Exchange>,
        response: &Exchange,
    ) -> Result<Vec<u8>> {
        self.base.encode_server_response(request, response)
    }

    fn content_type(&self, request: Option<&Exchange>, response: &Exchange) -> String {
        self.base.content_type(request, response)
    }

    fn assign_group(&self, exchange: &mut Exchange) {
        self.base.assign_group(exchange)
    }

    fn use_new_connection_for_resend(&self) -> bool {
        self.new_connection
            .unwrap_or_else(|| self.base.use_new_connection_for_resend())
    }

    fn use_new_codec_for_resend(&self) -> bool {
        self.new_codec
            .unwrap_or_else(|| self.base.use_new_codec_for_resend())
    }

    fn before_resend_client_request(&self, request: &Exchange) -> Result<Vec<u8>> {
        self.base.before_resend_client_request(request)
    }

    fn before_resend_server_response(&self, response: &Exchange) -> Result<Vec<u8>> {
        self.base.before_resend_server_response(response)
    }

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()> {
        self.base.chunk_arrived(direction, data)
    }

    fn pass_through(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        self.base.pass_through(direction)
    }

    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        self.base.available(direction)
    }

    fn flow_control(&self, direction: Direction, data: &[u8]) -> Result<Vec<u8>> {
        self.base.flow_control(direction, data)
    }

    fn is_interim_response(&self, response: &[u8]) -> bool {
        self.base.is_interim_response(response)
    }

    fn redact_body(&self, message: &[u8], note: &str) -> Vec<u8> {
        self.base.redact_body(message, note)
    }

    fn lossless(&self) -> bool {
        self.base.lossless()
    }
}

fn read_descriptor(path: &Path) -> Result<PluginDescriptor> {
    let plugin_err = |reason: String| ProxyError::Plugin {
        path: path.display().to_string(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| plugin_err(e.to_string()))?;
    let descriptor: PluginDescriptor =
        toml::from_str(&content).map_err(|e| plugin_err(e.to_string()))?;
    if descriptor.name.trim().is_empty() {
        return Err(plugin_err("empty codec name".to_string()));
    }
    Ok(descriptor)
}

/// Register every valid descriptor in `dir`. Bad descriptors are logged and skipped.
pub fn load_dir(registry: &CodecRegistry, dir: &Path) -> Result<usize> {
    let entries = std::fs::read_dir(dir).map_err(|e| ProxyError::Plugin {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let descriptor = match read_descriptor(&path) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Skipping codec plugin: {}", e);
                continue;
            }
        };
        if registry.contains(&descriptor.name) {
            warn!(
                "Skipping codec plugin {}: name {} already registered",
                path.display(),
                descriptor.name
            );
            continue;
        }
        let Some(base) = registry.factory(&descriptor.base) else {
            warn!(
                "Skipping codec plugin {}: unknown base codec {}",
                path.display(),
                descriptor.base
            );
            continue;
        };

        let name = descriptor.name.clone();
        registry.register(
            name.clone(),
            Arc::new(move |alpn: Option<&str>| {
                Arc::new(PluginCodec::new(&descriptor, base(alpn))) as Arc<dyn Codec>
            }),
        );
        info!("🔌 Loaded codec plugin {} from {}", name, path.display());
        loaded += 1;
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dir_registers_plugins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("keepalive.toml"),
            "name = \"HTTP-keepalive\"\nbase = \"HTTP\"\nuse_new_connection_for_resend = false\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("direct.toml"),
            "name = \"Direct\"\nbase = \"Sample\"\nuse_new_connection_for_resend = false\nuse_new_codec_for_resend = false\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = CodecRegistry::with_builtin();
        assert_eq!(registry.load_plugin_dir(dir.path()).unwrap(), 2);
        assert_eq!(
            registry.names(),
            vec!["Direct", "HTTP", "HTTP-keepalive", "Sample"]
        );

        let keepalive = registry.create("HTTP-keepalive", None).unwrap();
        assert_eq!(keepalive.name(), "HTTP-keepalive");
        assert!(!keepalive.use_new_connection_for_resend());
        assert!(keepalive.use_new_codec_for_resend());
        assert_eq!(
            keepalive.check_request_delimiter(b"GET / HTTP/1.1\r\n"),
            Boundary::Incomplete
        );

        let direct = registry.create("Direct", None).unwrap();
        assert!(!direct.use_new_connection_for_resend());
        assert!(!direct.use_new_codec_for_resend());
    }

    #[test]
    fn test_bad_descriptors_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(
            dir.path().join("orphan.toml"),
            "name = \"Orphan\"\nbase = \"QUIC\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("dup.toml"),
            "name = \"HTTP\"\nbase = \"Sample\"\n",
        )
        .unwrap();

        let registry = CodecRegistry::with_builtin();
        assert_eq!(registry.load_plugin_dir(dir.path()).unwrap(), 0);
        assert_eq!(registry.names(), vec!["HTTP", "Sample"]);
    }

    #[test]
    fn test_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = CodecRegistry::new();
        let err = registry.load_plugin_dir(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ProxyError::Plugin { .. }));
    }
}
