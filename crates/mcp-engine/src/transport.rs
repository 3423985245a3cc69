//! # Transport
//!
//! A transport moves frames between the engine and one client. Every session that
//! can carry server-initiated traffic owns an outbound queue ([`OutboundSender`]);
//! the adapter on the other end of the queue writes its items to the wire in the
//! order they were queued.
//!
//! | transport | session | server-initiated traffic |
//! | :-: | :-: | :-: |
//! | stdio | one, for the life of the process | interleaved with responses on stdout |
//! | streamable http, stateful | one per `initialize`, named by `Mcp-Session-Id` | `GET` event stream |
//! | streamable http, stateless | one per request, never stored | not available |

use std::borrow::Cow;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::TransportError, model::JsonRpcMessage};

#[cfg(feature = "transport-async-rw")]
pub mod stdio;
#[cfg(feature = "transport-async-rw")]
pub use stdio::{StdioTransport, serve_stdio};
#[cfg(feature = "transport-io")]
pub use stdio::stdio;

#[cfg(feature = "transport-streamable-http-server")]
pub mod http_header;
#[cfg(feature = "transport-streamable-http-server")]
pub mod streamable_http;
#[cfg(feature = "transport-streamable-http-server")]
pub use streamable_http::{StreamableHttpServerConfig, StreamableHttpService};

/// One item waiting in a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An encoded response to a client transmission.
    Response(Vec<u8>),
    /// A server-initiated request or notification.
    Message(JsonRpcMessage),
}

impl Outbound {
    pub fn encode(&self) -> serde_json::Result<Cow<'_, [u8]>> {
        match self {
            Outbound::Response(bytes) => Ok(Cow::Borrowed(bytes)),
            Outbound::Message(message) => serde_json::to_vec(message).map(Cow::Owned),
        }
    }
}

pub type OutboundSender = mpsc::Sender<Outbound>;
pub type OutboundReceiver = mpsc::Receiver<Outbound>;

pub fn outbound_channel(buffer: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(buffer.max(1))
}

/// A framed, bidirectional byte channel to a single client.
#[async_trait]
pub trait Transport: Send {
    /// The next frame, or `None` once the peer has disconnected.
    async fn receive(&mut self) -> Option<Result<String, TransportError>>;

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
