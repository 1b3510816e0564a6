//! Shared data model for the session pipeline
//!
//! Types in this crate cross crate boundaries (core pipeline, agent binary,
//! admin API) and are therefore serde-serializable.

pub mod exchange;
pub mod snapshot;

pub use exchange::{
    Addressing, ConnectionId, Direction, Exchange, ExchangeId, GroupId, ListenerId,
};
pub use snapshot::Snapshot;
