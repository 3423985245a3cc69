#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::{
    ConfigError, CorrelationError, EngineError, ErrorData, MalformedError, SessionError,
    TransportError,
};

/// Basic data types of the MCP protocol
pub mod model;

pub mod codec;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod engine;
pub mod handler;
pub mod notification;
pub mod session;
pub mod transport;

pub use config::{EngineConfig, ExecutionMode, SequentialFaultPolicy};
pub use correlation::{CorrelationEngine, ElicitationError, Peer, RequestKind};
pub use engine::{Engine, EngineBuilder};
pub use handler::{
    Handler, HandlerRegistry, Permission, PermissionCheck, Principal, RequestContext,
};
pub use notification::NotificationFanout;
pub use session::{Session, SessionId, SessionState, SessionStore, TransportKind};

// re-export
#[cfg(feature = "schemars")]
pub use schemars;
pub use serde;
pub use serde_json;
