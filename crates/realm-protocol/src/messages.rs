//! Wire messages exchanged between clients and the room server.
//!
//! Every message is a flat record. Requests travel as [`ClientMessage`],
//! answers and broadcasts as [`ServerMessage`], both wrapped in an
//! [`Envelope`] and internally tagged by a `"type"` field:
//!
//! ```json
//! {"seq":3,"timestamp":812,"payload":{"type":"JoinRoom","target":{"name":"Arena"},"token":null}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MatchId, RoomId, RoomState, RoomTarget};

/// Page size used when a room query does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer wrapper for every message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// Per-connection sequence number, assigned by the sender.
    pub seq: u64,
    /// Sender-relative milliseconds.
    pub timestamp: u64,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(seq: u64, timestamp: u64, payload: P) -> Self {
        Self {
            seq,
            timestamp,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Room listings
// ---------------------------------------------------------------------------

/// Public view of a room, as returned by create/join acks and queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    pub state: RoomState,
    pub player_count: usize,
    pub max_players: usize,
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
}

/// Which rooms a query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomFilter {
    /// Case-insensitive substring of the room name.
    pub name_contains: Option<String>,
    /// Exact world segment name.
    pub segment: Option<String>,
    /// Every pair must be present in the room's custom data.
    pub custom: BTreeMap<String, String>,
    pub include_full: bool,
    pub include_private: bool,
}

/// Sort order for room queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Creation order (oldest first when ascending).
    #[default]
    Created,
    Name,
    PlayerCount,
}

/// A paginated room listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomQuery {
    #[serde(default)]
    pub filter: RoomFilter,
    /// Zero-based page number.
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub sort: SortKey,
    #[serde(default)]
    pub descending: bool,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for RoomQuery {
    fn default() -> Self {
        Self {
            filter: RoomFilter::default(),
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            sort: SortKey::default(),
            descending: false,
        }
    }
}

/// One page of a room query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPage {
    pub rooms: Vec<RoomSummary>,
    pub page: u32,
    /// Effective page size after server-side clamping.
    pub page_size: u32,
    /// Number of rooms matching the filter across all pages.
    pub total: usize,
}

/// Changed fields of one room. Absent fields did not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDelta {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RoomState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
}

impl RoomDelta {
    pub fn players(room_id: RoomId, player_count: usize) -> Self {
        Self {
            room_id,
            player_count: Some(player_count),
            state: None,
            segment: None,
        }
    }

    pub fn state(room_id: RoomId, state: RoomState) -> Self {
        Self {
            room_id,
            player_count: None,
            state: Some(state),
            segment: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Machine-readable reason attached to [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NameTaken,
    NotFound,
    NotEmpty,
    Busy,
    Full,
    AccessDenied,
    Timeout,
    AlreadyInRoom,
    NotInRoom,
    NotJoinable,
    AlreadyMatching,
    InvalidRequest,
    Unavailable,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// The client finished its own setup and may be placed in rooms.
    Ready,

    /// Create a room either from a server-published template or from a
    /// raw segment name. Without either, the room is headless.
    CreateRoom {
        name: String,
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        segment: Option<String>,
        #[serde(default)]
        max_players: Option<usize>,
        #[serde(default)]
        private: bool,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        custom_data: BTreeMap<String, String>,
    },

    JoinRoom {
        target: RoomTarget,
        #[serde(default)]
        token: Option<String>,
    },

    /// Leave the current room. Empty rooms are torn down.
    ExitRoom,

    QueryRooms {
        #[serde(default)]
        query: RoomQuery,
    },

    /// Queue for attribute-based matchmaking.
    FindMatch {
        #[serde(default)]
        criteria: BTreeMap<String, String>,
    },

    CancelMatch { ticket: MatchId },
}

/// Messages the server sends: acks, errors and broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    RoomCreated { room: RoomSummary },
    RoomJoined { room: RoomSummary },
    /// Sent to the leaving connection once its binding is gone.
    RoomExited { room_id: RoomId },
    RoomList { page: RoomPage },
    /// Broadcast whenever a room's visible fields change.
    RoomUpdated { delta: RoomDelta },
    MatchQueued { ticket: MatchId },
    MatchFound { ticket: MatchId, room_id: RoomId },
    MatchCancelled { ticket: MatchId, cancelled: bool },
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}
