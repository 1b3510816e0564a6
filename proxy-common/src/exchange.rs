//! Recorded messages and the identifiers that link them
//!
//! An [`Exchange`] is one directional message flowing through a session
//! pipeline. It carries a byte snapshot for every pipeline stage so the
//! history view can show what arrived, what the codec made of it, what the
//! rules and the operator changed, and what finally went out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::snapshot::Snapshot;

/// Which side of the connection produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to server (requests)
    Client,
    /// Server to client (responses)
    Server,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Client => Direction::Server,
            Direction::Server => Direction::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Client => "client",
            Direction::Server => "server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Opaque identity of a live session (one client/server connection pair)
    ConnectionId(u64),
    "conn-"
);
id_type!(
    /// Links a request exchange to its response exchange
    GroupId(u64),
    "group-"
);
id_type!(
    /// Monotonically increasing identity assigned by the history store.
    /// `ExchangeId(0)` means "not yet recorded".
    ExchangeId(u64),
    "#"
);
id_type!(
    /// The listening port a session was accepted on
    ListenerId(u16),
    "listener-"
);

/// Where a message travelled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressing {
    pub listener: ListenerId,
    pub client: SocketAddr,
    pub server: SocketAddr,
    /// Host name used to reach the server (SNI / Host), falls back to the address
    pub server_name: String,
    pub tls: bool,
}

impl Addressing {
    pub fn new(listener: ListenerId, client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            listener,
            client,
            server,
            server_name: server.ip().to_string(),
            tls: false,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

/// One recorded request or response plus its pipeline-stage snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub id: ExchangeId,
    pub direction: Direction,
    pub addressing: Addressing,

    /// Bytes exactly as delimited off the wire
    pub received: Vec<u8>,
    /// Codec output for `received`
    pub decoded: Vec<u8>,
    /// `decoded` after modification rules ran
    pub rule_modified: Vec<u8>,
    /// Bytes handed to the encoder (operator edits included)
    pub modified_data: Vec<u8>,
    /// Bytes written to the peer
    pub sent: Vec<u8>,

    /// Set when rules or the operator changed the payload, or it was dropped
    pub modified: bool,
    /// Set when the exchange was multiplied through forward-multiple
    pub resend: bool,

    pub content_type: String,
    pub codec: String,
    /// Negotiated sub-protocol, if any
    pub alpn: Option<String>,
    pub conn: ConnectionId,
    pub group: GroupId,
    pub created_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(
        direction: Direction,
        addressing: Addressing,
        codec: impl Into<String>,
        alpn: Option<String>,
        conn: ConnectionId,
        group: GroupId,
    ) -> Self {
        Self {
            id: ExchangeId::default(),
            direction,
            addressing,
            received: Vec::new(),
            decoded: Vec::new(),
            rule_modified: Vec::new(),
            modified_data: Vec::new(),
            sent: Vec::new(),
            modified: false,
            resend: false,
            content_type: String::new(),
            codec: codec.into(),
            alpn,
            conn,
            group,
            created_at: Utc::now(),
        }
    }

    pub fn is_recorded(&self) -> bool {
        self.id != ExchangeId::default()
    }

    /// Largest stage snapshot, used to decide how often a record is persisted
    pub fn payload_len(&self) -> usize {
        self.received
            .len()
            .max(self.decoded.len())
            .max(self.modified_data.len())
    }

    /// Freeze addressing plus `data` into a replayable snapshot
    pub fn snapshot(&self, data: Vec<u8>) -> Snapshot {
        Snapshot {
            direction: self.direction,
            addressing: self.addressing.clone(),
            data,
            codec: self.codec.clone(),
            alpn: self.alpn.clone(),
            conn: self.conn,
            group: self.group,
        }
    }

    /// Snapshot of the payload an operator would resend by default
    pub fn resend_snapshot(&self) -> Snapshot {
        let data = if self.modified_data.is_empty() && !self.modified {
            self.decoded.clone()
        } else {
            self.modified_data.clone()
        };
        self.snapshot(data)
    }

    /// Printable preview of the decoded payload
    pub fn summary(&self) -> String {
        self.decoded
            .iter()
            .take(100)
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect()
    }
}
