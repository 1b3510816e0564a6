//! Hook points a pipeline installs on a session
//!
//! A session exposes boundary, received, send and forced-send hooks for each
//! direction, plus the chunk and flow-control hooks multi-frame codecs need.
//! Exactly one hook set may be installed per session. While dispatch is
//! disabled (or nothing is installed) every hook is an identity passthrough
//! and boundary checks accept all buffered bytes, which is how codec-less
//! tunnels run.

use async_trait::async_trait;
use parking_lot::RwLock;
use proxy_common::Direction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::{Boundary, FrameQueue};
use crate::engine::EngineHooks;
use crate::error::ProxyError;
use crate::Result;

/// The hook set a pipeline installs. `direction` is the side that produced the bytes.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    fn boundary(&self, direction: Direction, data: &[u8]) -> Result<Boundary>;

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()>;

    fn pass_through(&self, direction: Direction) -> Result<Option<Vec<u8>>>;

    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>>;

    async fn received(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>>;

    async fn send(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Operator resend outside the normal receive path
    async fn send_forced(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>>;

    fn flow_control(&self, _direction: Direction, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// The dispatch target of a session at one moment
#[derive(Clone)]
pub enum HookDispatch {
    Disabled,
    Enabled(Arc<dyn SessionHooks>),
}

/// Owns a session's single hook slot, its on/off switch, and the buffers
/// backing the passthrough defaults
pub struct Dispatcher {
    installed: RwLock<Option<Arc<dyn SessionHooks>>>,
    enabled: AtomicBool,
    fallback: FrameQueue,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            installed: RwLock::new(None),
            enabled: AtomicBool::new(false),
            fallback: FrameQueue::new(),
        }
    }

    /// Install the session's hook set and enable dispatch. Only once per session.
    pub fn install(&self, hooks: Arc<dyn SessionHooks>) -> Result<()> {
        let mut slot = self.installed.write();
        if slot.is_some() {
            return Err(ProxyError::hook("session already has hooks installed"));
        }
        *slot = Some(hooks);
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.read().is_some()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> HookDispatch {
        if !self.is_enabled() {
            return HookDispatch::Disabled;
        }
        match self.installed.read().as_ref() {
            Some(hooks) => HookDispatch::Enabled(hooks.clone()),
            None => HookDispatch::Disabled,
        }
    }
}

#[async_trait]
impl SessionHooks for Dispatcher {
    fn boundary(&self, direction: Direction, data: &[u8]) -> Result<Boundary> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.boundary(direction, data),
            HookDispatch::Disabled => Ok(Boundary::Complete(data.len())),
        }
    }

    fn chunk_arrived(&self, direction: Direction, data: &[u8]) -> Result<()> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.chunk_arrived(direction, data),
            HookDispatch::Disabled => {
                self.fallback.push(direction, data);
                Ok(())
            }
        }
    }

    fn pass_through(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.pass_through(direction),
            HookDispatch::Disabled => Ok(None),
        }
    }

    fn available(&self, direction: Direction) -> Result<Option<Vec<u8>>> {
        // Bytes buffered while disabled drain even after hooks are switched on
        if let Some(pending) = self.fallback.take(direction) {
            return Ok(Some(pending));
        }
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.available(direction),
            HookDispatch::Disabled => Ok(None),
        }
    }

    async fn received(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.received(direction, data).await,
            HookDispatch::Disabled => Ok(data),
        }
    }

    async fn send(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.send(direction, data).await,
            HookDispatch::Disabled => Ok(data),
        }
    }

    async fn send_forced(&self, direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.send_forced(direction, data).await,
            HookDispatch::Disabled => Ok(data),
        }
    }

    fn flow_control(&self, direction: Direction, data: &[u8]) -> Result<Vec<u8>> {
        match self.current() {
            HookDispatch::Enabled(hooks) => hooks.flow_control(direction, data),
            HookDispatch::Disabled => Ok(data.to_vec()),
        }
    }
}

/// One direction of a dispatcher, as seen by a stream engine
pub(crate) struct DirectionHooks {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) direction: Direction,
}

#[async_trait]
impl EngineHooks for DirectionHooks {
    fn boundary(&self, data: &[u8]) -> Result<Boundary> {
        self.dispatcher.boundary(self.direction, data)
    }

    fn chunk_arrived(&self, data: &[u8]) -> Result<()> {
        self.dispatcher.chunk_arrived(self.direction, data)
    }

    fn pass_through(&self) -> Result<Option<Vec<u8>>> {
        self.dispatcher.pass_through(self.direction)
    }

    fn available(&self) -> Result<Option<Vec<u8>>> {
        self.dispatcher.available(self.direction)
    }

    async fn received(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.dispatcher.received(self.direction, data).await
    }

    async fn send(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        self.dispatcher.send(self.direction, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl SessionHooks for Upper {
        fn boundary(&self, _direction: Direction, _data: &[u8]) -> Result<Boundary> {
            Ok(Boundary::Incomplete)
        }
        fn chunk_arrived(&self, _direction: Direction, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn pass_through(&self, _direction: Direction) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn available(&self, _direction: Direction) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn received(&self, _direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
            Ok(data.to_ascii_uppercase())
        }
        async fn send(&self, _direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
            Ok(data)
        }
        async fn send_forced(&self, _direction: Direction, data: Vec<u8>) -> Result<Vec<u8>> {
            Ok([b"forced:".as_slice(), &data].concat())
        }
    }

    #[tokio::test]
    async fn test_disabled_dispatch_is_passthrough() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(dispatcher.current(), HookDispatch::Disabled));
        assert_eq!(
            dispatcher.boundary(Direction::Client, b"abc").unwrap(),
            Boundary::Complete(3)
        );
        dispatcher.chunk_arrived(Direction::Client, b"ab").unwrap();
        dispatcher.chunk_arrived(Direction::Client, b"c").unwrap();
        assert_eq!(dispatcher.pass_through(Direction::Client).unwrap(), None);
        assert_eq!(
            dispatcher.available(Direction::Client).unwrap(),
            Some(b"abc".to_vec())
        );
        assert_eq!(dispatcher.available(Direction::Server).unwrap(), None);
        assert_eq!(
            dispatcher.received(Direction::Server, b"x".to_vec()).await.unwrap(),
            b"x"
        );
        assert_eq!(
            dispatcher.send_forced(Direction::Client, b"y".to_vec()).await.unwrap(),
            b"y"
        );
    }

    #[tokio::test]
    async fn test_install_once_and_toggle() {
        let dispatcher = Dispatcher::new();
        dispatcher.install(Arc::new(Upper)).unwrap();
        assert!(dispatcher.is_installed());
        assert!(dispatcher.install(Arc::new(Upper)).is_err());

        assert_eq!(
            dispatcher.received(Direction::Client, b"get".to_vec()).await.unwrap(),
            b"GET"
        );
        assert_eq!(
            dispatcher.boundary(Direction::Client, b"get").unwrap(),
            Boundary::Incomplete
        );

        dispatcher.set_enabled(false);
        assert_eq!(
            dispatcher.received(Direction::Client, b"get".to_vec()).await.unwrap(),
            b"get"
        );

        dispatcher.set_enabled(true);
        assert_eq!(
            dispatcher.send_forced(Direction::Client, b"x".to_vec()).await.unwrap(),
            b"forced:x"
        );
    }
}
