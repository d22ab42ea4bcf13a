//! Unified error type for the Realm server.

use realm_protocol::ProtocolError;
use realm_room::RoomError;
use realm_router::RouterError;
use realm_transport::TransportError;

/// Top-level error that wraps every layer's error.
///
/// The `#[from]` conversions let `?` lift sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum RealmError {
    /// Binding, accepting, sending or receiving failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The room server rejected a request or is gone.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A router subscriber failed. Fatal for the server run loop.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// The router pump task panicked or was cancelled.
    #[error("router task ended abnormally: {0}")]
    RouterTask(#[from] tokio::task::JoinError),
}
