//! In-memory exchange history
//!
//! The store assigns exchange identities, invents group ids, and keeps the
//! latest version of every exchange. Request/response pairing is by group
//! only. All access goes through one coarse lock so readers never observe
//! half-applied updates.

use parking_lot::Mutex;
use proxy_common::{ConnectionId, Exchange, ExchangeId, GroupId};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ProxyError;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Inserted { id: ExchangeId },
    Updated { id: ExchangeId },
}

#[derive(Default)]
struct HistoryInner {
    entries: BTreeMap<ExchangeId, Exchange>,
    next_id: u64,
    next_group: u64,
}

pub struct HistoryStore {
    inner: Mutex<HistoryInner>,
    events: broadcast::Sender<HistoryEvent>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(HistoryInner {
                entries: BTreeMap::new(),
                next_id: 1,
                next_group: 1,
            }),
            events,
        }
    }

    /// Fresh group id for a request, or a response that arrived first
    pub fn next_group(&self) -> GroupId {
        let mut inner = self.inner.lock();
        let group = GroupId(inner.next_group);
        inner.next_group += 1;
        group
    }

    /// Record `exchange`, assigning its identity
    pub fn insert(&self, exchange: &mut Exchange) -> ExchangeId {
        let id = {
            let mut inner = self.inner.lock();
            let id = ExchangeId(inner.next_id);
            inner.next_id += 1;
            exchange.id = id;
            inner.entries.insert(id, exchange.clone());
            id
        };
        debug!("history insert {} ({} {})", id, exchange.direction, exchange.conn);
        let _ = self.events.send(HistoryEvent::Inserted { id });
        id
    }

    /// Replace the stored copy of an already-recorded exchange
    pub fn update(&self, exchange: &Exchange) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(&exchange.id) {
                Some(slot) => *slot = exchange.clone(),
                None => {
                    return Err(ProxyError::hook(format!(
                        "exchange {} is not recorded",
                        exchange.id
                    )))
                }
            }
        }
        let _ = self.events.send(HistoryEvent::Updated { id: exchange.id });
        Ok(())
    }

    pub fn get(&self, id: ExchangeId) -> Option<Exchange> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Every exchange in identity order
    pub fn all(&self) -> Vec<Exchange> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Up to `limit` most recent exchanges, newest last
    pub fn latest(&self, limit: usize) -> Vec<Exchange> {
        let inner = self.inner.lock();
        let skip = inner.entries.len().saturating_sub(limit);
        inner.entries.values().skip(skip).cloned().collect()
    }

    pub fn by_group(&self, group: GroupId) -> Vec<Exchange> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.group == group)
            .cloned()
            .collect()
    }

    pub fn by_connection(&self, conn: ConnectionId) -> Vec<Exchange> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.conn == conn)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }
}
