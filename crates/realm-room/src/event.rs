//! Notifications published by the room server.

use realm_protocol::{MatchId, RoomId, RoomState};
use realm_transport::ConnectionId;

use crate::RoomInfo;

/// Everything collaborators (spawners, chat, lobby broadcasts) can observe.
///
/// Events are published in the order the operations that caused them
/// complete, and only after the registry reflects the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A room finished its first load and is `Active`.
    CreatedRoom(RoomInfo),

    /// `connection` is now bound to `room`.
    JoinedRoom {
        connection: ConnectionId,
        room: RoomId,
        players: usize,
    },

    /// `connection` left `room` on request.
    ExitedRoom {
        connection: ConnectionId,
        room: RoomId,
        players: usize,
    },

    /// `connection` left `room` because the transport dropped it.
    DisconnectedRoom {
        connection: ConnectionId,
        room: RoomId,
        players: usize,
    },

    StateChanged {
        room: RoomId,
        from: RoomState,
        to: RoomState,
    },

    /// A world load or unload failed. The room is left as it was for a
    /// supervisor to inspect or force-close.
    SceneFailed { room: RoomId, reason: String },

    /// A match request was placed into `room`.
    MatchPlaced {
        ticket: MatchId,
        room: RoomId,
        connections: Vec<ConnectionId>,
    },

    /// A match request expired before it could be placed.
    MatchExpired {
        ticket: MatchId,
        connections: Vec<ConnectionId>,
    },
}

impl RoomEvent {
    /// The room this event concerns, if any.
    pub fn room(&self) -> Option<RoomId> {
        match self {
            Self::CreatedRoom(info) => Some(info.room_id),
            Self::JoinedRoom { room, .. }
            | Self::ExitedRoom { room, .. }
            | Self::DisconnectedRoom { room, .. }
            | Self::StateChanged { room, .. }
            | Self::SceneFailed { room, .. }
            | Self::MatchPlaced { room, .. } => Some(*room),
            Self::MatchExpired { .. } => None,
        }
    }
}
