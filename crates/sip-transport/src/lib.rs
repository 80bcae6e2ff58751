//! Transport collaborator interface.
//!
//! The signaling engine never touches sockets. It is handed parsed messages
//! together with their reception metadata, and it hands encoded-ready
//! messages back through the [`Transport`] trait. Connection caching,
//! reconnects, and retry policy live entirely behind this trait; the engine
//! treats any send error as a transport failure to escalate.
//!
//! [`mock::MockTransport`] is the in-memory implementation the engine's
//! tests run against.

pub mod mock;

pub use mock::MockTransport;

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;

use sipline_sip_core::Message;

/// Errors surfaced by a transport implementation.
///
/// The engine does not distinguish between these beyond logging: every
/// variant terminates the owning transaction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("no route to destination {0}")]
    Unreachable(SocketAddr),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A message channel capable of delivering SIP messages to a peer.
///
/// One instance corresponds to one transport flow (a UDP socket, a TCP or
/// TLS connection). Implementations may retry or reconnect internally;
/// an error returned here means the message could not be delivered.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Send a message to the destination. Implementations pick the flow
    /// from the destination and the message kind (requests open client
    /// flows, responses reuse the server flow).
    async fn send_message(&self, message: Message, destination: SocketAddr) -> Result<()>;

    /// Whether this transport is reliable (TCP/TLS). Reliable transports
    /// suppress retransmission timers and zero the linger timers.
    fn is_reliable(&self) -> bool;

    /// Transport token as it appears in Via ("UDP", "TCP", "TLS", "WS").
    fn transport_kind(&self) -> &'static str;

    /// Local address this channel is bound to.
    fn local_addr(&self) -> SocketAddr;
}
