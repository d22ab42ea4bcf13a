//! Transport layer for Realm.
//!
//! The room core never talks to sockets directly. It sees two things from
//! this crate: opaque [`ConnectionId`] handles, and the raw
//! [`TransportEvent`] signals a listener emits as connections come and go.
//! The [`Transport`] and [`Connection`] traits describe the byte pipes the
//! server front door drives.
//!
//! # Feature Flags
//!
//! - `websocket` (default) — WebSocket transport via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::net::SocketAddr;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TransportEvent
// ---------------------------------------------------------------------------

/// A raw lifecycle signal produced by the networking layer.
///
/// These are deliberately transport-shaped (peer addresses, close reasons).
/// The router turns them into the typed server events room logic consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The listener is bound and accepting connections.
    Listening { addr: Option<SocketAddr> },
    /// The listener stopped; no further connections will arrive.
    ShutDown,
    /// A peer completed the transport handshake.
    Accepted {
        connection: ConnectionId,
        peer: Option<SocketAddr>,
    },
    /// The peer announced it is ready to take part in rooms.
    Ready { connection: ConnectionId },
    /// The connection is gone, cleanly or not.
    Closed {
        connection: ConnectionId,
        reason: Option<String>,
    },
}

impl TransportEvent {
    /// The connection this signal concerns, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Self::Accepted { connection, .. }
            | Self::Ready { connection }
            | Self::Closed { connection, .. } => Some(*connection),
            Self::Listening { .. } | Self::ShutDown => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Returns the address the transport is listening on.
    fn local_addr(&self) -> Result<SocketAddr, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single connection that can send and receive bytes.
///
/// Implementations must allow `send` and `recv` to run concurrently from
/// different tasks: the server reads on one task and writes on another.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends data to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Returns the remote address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
