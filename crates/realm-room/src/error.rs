//! Error types for the room layer.

use realm_protocol::{ErrorCode, MatchId, RoomId, RoomState, RoomTarget};
use realm_transport::ConnectionId;

/// Errors that can occur during room operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Another room already uses this name.
    #[error("room name {0:?} is already taken")]
    NameTaken(String),

    /// No room matches the id or name.
    #[error("room {0} not found")]
    NotFound(RoomTarget),

    /// The room still has bound connections.
    #[error("room {0} still has {1} connection(s) bound")]
    NotEmpty(RoomId, usize),

    /// The room has a scene transition queued or running.
    #[error("room {0} has an operation in progress")]
    Busy(RoomId),

    /// No free seat.
    #[error("room {0} is full")]
    Full(RoomId),

    /// A validator rejected the request.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The room did not become joinable within the retry budget.
    #[error("room {0} did not finish loading in time")]
    Timeout(RoomId),

    /// The connection is bound to, or waiting to join, a room already.
    #[error("{0} is already in room {1}")]
    AlreadyInRoom(ConnectionId, RoomId),

    /// Explicit exit from a connection with no binding.
    #[error("{0} is not in any room")]
    NotInRoom(ConnectionId),

    /// The room is closing and takes no more connections.
    #[error("room {0} is {1} and cannot accept connections")]
    NotJoinable(RoomId, RoomState),

    /// The connection already waits in a matchmaking request.
    #[error("{0} is already queued in match {1}")]
    AlreadyMatching(ConnectionId, MatchId),

    /// No template with this category has been published.
    #[error("no room template for category {0:?}")]
    UnknownTemplate(String),

    /// The request is structurally invalid.
    #[error("invalid room spec: {0}")]
    InvalidSpec(String),

    /// The room server task is gone.
    #[error("room server is unavailable")]
    Unavailable,
}

impl RoomError {
    /// The wire code reported to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NameTaken(_) => ErrorCode::NameTaken,
            Self::NotFound(_) | Self::UnknownTemplate(_) => ErrorCode::NotFound,
            Self::NotEmpty(..) => ErrorCode::NotEmpty,
            Self::Busy(_) => ErrorCode::Busy,
            Self::Full(_) => ErrorCode::Full,
            Self::AccessDenied(_) => ErrorCode::AccessDenied,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::AlreadyInRoom(..) => ErrorCode::AlreadyInRoom,
            Self::NotInRoom(_) => ErrorCode::NotInRoom,
            Self::NotJoinable(..) => ErrorCode::NotJoinable,
            Self::AlreadyMatching(..) => ErrorCode::AlreadyMatching,
            Self::InvalidSpec(_) => ErrorCode::InvalidRequest,
            Self::Unavailable => ErrorCode::Unavailable,
        }
    }
}
