use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{plugin, Codec, Http1Codec, RawCodec};
use crate::error::ProxyError;
use crate::Result;

/// Builds a fresh codec instance for one session, given the negotiated sub-protocol
pub type CodecFactory = Arc<dyn Fn(Option<&str>) -> Arc<dyn Codec> + Send + Sync>;

/// Name-keyed codec factories, populated at startup
#[derive(Default)]
pub struct CodecRegistry {
    factories: DashMap<String, CodecFactory>,
}

impl CodecRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in codecs
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(
            RawCodec::NAME,
            Arc::new(|_alpn: Option<&str>| Arc::new(RawCodec::new()) as Arc<dyn Codec>),
        );
        registry.register(
            Http1Codec::NAME,
            Arc::new(|_alpn: Option<&str>| Arc::new(Http1Codec::new()) as Arc<dyn Codec>),
        );
        registry
    }

    /// Add or replace a factory
    pub fn register(&self, name: impl Into<String>, factory: CodecFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            info!("Replaced codec factory {}", name);
        }
    }

    /// Load every plugin descriptor in `dir`; returns how many were registered
    pub fn load_plugin_dir(&self, dir: &Path) -> Result<usize> {
        plugin::load_dir(self, dir)
    }

    pub fn factory(&self, name: &str) -> Option<CodecFactory> {
        self.factories.get(name).map(|entry| entry.value().clone())
    }

    pub fn create(&self, name: &str, alpn: Option<&str>) -> Result<Arc<dyn Codec>> {
        let factory = self.factory(name).ok_or_else(|| ProxyError::UnknownCodec {
            name: name.to_string(),
        })?;
        Ok(factory(alpn))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Sorted codec names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_common::{Addressing, ConnectionId, Direction, Exchange, GroupId, ListenerId};

    #[test]
    fn test_builtin_names_sorted() {
        let registry = CodecRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["HTTP".to_string(), "Sample".to_string()]);
        assert!(registry.contains("HTTP"));
    }

    #[test]
    fn test_unknown_codec() {
        let registry = CodecRegistry::with_builtin();
        let err = registry.create("gRPC", None).err().unwrap();
        assert!(matches!(err, ProxyError::UnknownCodec { .. }));
    }

    #[test]
    fn test_instances_are_independent() {
        let registry = CodecRegistry::with_builtin();
        let a = registry.create("Sample", None).unwrap();
        let b = registry.create("Sample", None).unwrap();
        a.chunk_arrived(Direction::Client, b"only a").unwrap();
        assert_eq!(b.available(Direction::Client).unwrap(), None);
        assert_eq!(
            a.available(Direction::Client).unwrap(),
            Some(b"only a".to_vec())
        );
    }

    #[test]
    fn test_lossless_codecs_round_trip() {
        let registry = CodecRegistry::with_builtin();
        let addressing = Addressing::new(
            ListenerId(1),
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        let messages: [&[u8]; 3] = [
            b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            &[0u8, 1, 2, 255],
        ];

        for name in registry.names() {
            let codec = registry.create(&name, None).unwrap();
            if !codec.lossless() {
                continue;
            }
            for message in messages {
                let mut req = Exchange::new(
                    Direction::Client,
                    addressing.clone(),
                    name.clone(),
                    None,
                    ConnectionId(1),
                    GroupId(1),
                );
                req.received = message.to_vec();
                req.decoded = codec.decode_client_request(&req).unwrap();
                req.modified_data = req.decoded.clone();
                assert_eq!(codec.encode_client_request(&req).unwrap(), message);

                let mut resp = Exchange::new(
                    Direction::Server,
                    addressing.clone(),
                    name.clone(),
                    None,
                    ConnectionId(1),
                    GroupId(1),
                );
                resp.received = message.to_vec();
                resp.decoded = codec.decode_server_response(Some(&req), &resp).unwrap();
                resp.modified_data = resp.decoded.clone();
                assert_eq!(
                    codec.encode_server_response(Some(&req), &resp).unwrap(),
                    message
                );
            }
        }
    }
}
