use serde::{Deserialize, Serialize};

use crate::exchange::{Addressing, ConnectionId, Direction, GroupId};

/// Immutable, fully-resolved copy of an exchange's addressing and payload.
///
/// A snapshot is the unit of replay: it does not reference any live session,
/// so it stays valid after the connection that produced it is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub direction: Direction,
    pub addressing: Addressing,
    pub data: Vec<u8>,
    pub codec: String,
    pub alpn: Option<String>,
    pub conn: ConnectionId,
    pub group: GroupId,
}

impl Snapshot {
    /// Same addressing, different payload
    pub fn with_data(&self, data: Vec<u8>) -> Self {
        Self {
            data,
            ..self.clone()
        }
    }

    /// Response-side snapshot sharing this snapshot's connection and group
    pub fn response(&self, data: Vec<u8>) -> Self {
        Self {
            direction: Direction::Server,
            data,
            ..self.clone()
        }
    }
}
