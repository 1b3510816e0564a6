//! Proxy Core Library
//!
//! This library provides the session pipeline of the intercepting proxy:
//! stream engines, sessions, hook assembly, the intercept gate, the
//! connection registry and replay.

pub mod admin;
pub mod codec;
pub mod engine;
pub mod gate;
pub mod history;
pub mod pipeline;
pub mod registry;
pub mod replay;
pub mod session;
pub mod transport;

/// Configuration types and utilities
pub mod config;

/// Runtime traffic policy (modification and intercept rules)
pub mod policy;

/// Error types for proxy operations
pub mod error;

pub use admin::{start_admin_server, AdminState, Metrics};
pub use codec::{Boundary, Codec, CodecRegistry};
pub use config::{GateConfig, ListenerConfig, PipelineConfig, ProxyConfig, ReplayConfig};
pub use engine::{EngineOutcome, StreamEngine};
pub use error::ProxyError;
pub use gate::{GateOutcome, InterceptGate, PendingReview, Resender};
pub use history::{HistoryEvent, HistoryStore};
pub use pipeline::{assemble_intercept, assemble_one_shot, assemble_shared_replay, PipelineContext};
pub use policy::{InterceptOptions, InterceptRule, ModificationRule, ModificationRules};
pub use registry::ConnectionRegistry;
pub use replay::{ReplayController, ReplayMode, ReplayReport, ReplayResult};
pub use session::{HookDispatch, Session, SessionHooks, SessionOptions, Strategy};
pub use transport::{Dialer, Endpoint, TcpDialer};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
