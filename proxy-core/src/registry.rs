//! Live session lookup
//!
//! Sessions are registered once their transport is up so a later replay can
//! reuse the original connection instead of dialing a new one.

use dashmap::DashMap;
use proxy_common::{ConnectionId, ListenerId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::session::Session;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionId, Arc<Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        debug!("registering {}", session.id());
        self.sessions.insert(session.id(), session);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn has(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close and evict every session accepted on `listener`
    pub async fn close_and_clear(&self, listener: ListenerId) -> usize {
        let ids: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().listener() == Some(listener))
            .map(|entry| *entry.key())
            .collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close().await;
                closed += 1;
            }
        }
        info!("Closed {} session(s) on {}", closed, listener);
        closed
    }
}
