//! Identifiers and the room lifecycle shared by server and clients.
//!
//! Ids are newtypes over `u64` rather than bare integers. A function that
//! takes a [`RoomId`] cannot be handed a [`MatchId`] by mistake, and both
//! still serialize as plain numbers because of `#[serde(transparent)]`.
//!
//! Clients usually know a room by its name, game code by its id.
//! [`RoomTarget`] carries either, and converts from `&str`, `String` and
//! [`RoomId`], so `rooms.join_room(conn, "Arena", None)` and
//! `rooms.join_room(conn, room_id, None)` both read naturally.
//!
//! [`RoomState`] lives here, not in the room crate, because clients see it
//! in listings and deltas. The transition table in
//! [`RoomState::can_transition_to`] is the single source of truth for
//! which moves are legal; the registry asserts against it on every change.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a room.
///
/// Serialized as a bare number (`42`, not `{"0":42}`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R-{}", self.0)
    }
}

/// Ticket identifying a pending matchmaking request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MatchId(pub u64);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M-{}", self.0)
    }
}

/// Addresses a room by numeric id or by its unique name.
///
/// On the wire: `{"id": 7}` or `{"name": "Arena"}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomTarget {
    Id(RoomId),
    Name(String),
}

impl From<RoomId> for RoomTarget {
    fn from(id: RoomId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for RoomTarget {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for RoomTarget {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for RoomTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// RoomState
// ---------------------------------------------------------------------------

/// The lifecycle state of a room.
///
/// ```text
///              ┌────────────── world change ──────────────┐
///              ▼                                          │
/// Created → Loading ──────────────────────────────→ Active ─→ Closing → Destroyed
///    │         │                                              ▲
///    └─────────┴──────────── force close ─────────────────────┘
/// ```
///
/// - **Created**: registered, nothing loaded yet. Transient.
/// - **Loading**: a world segment load (or the unload preceding a world
///   change) is queued or running. Joins wait.
/// - **Active**: the world is loaded; connections may bind.
/// - **Closing**: teardown started; no new bindings.
/// - **Destroyed**: removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomState {
    Created,
    Loading,
    Active,
    Closing,
    Destroyed,
}

impl RoomState {
    /// Returns `true` if connections may bind right now.
    pub fn is_joinable(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns `true` while a world segment is on its way in.
    ///
    /// Joins against a pending room are parked rather than rejected.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Created | Self::Loading)
    }

    /// Returns `true` if the room holds a world segment reference.
    pub fn holds_world(&self) -> bool {
        matches!(self, Self::Active | Self::Closing)
    }

    /// Returns `true` if transitioning to `target` is valid.
    pub fn can_transition_to(self, target: Self) -> bool {
        use RoomState::*;
        matches!(
            (self, target),
            (Created, Loading)
                | (Loading, Active)
                | (Active, Loading)
                | (Active, Closing)
                | (Loading, Closing)
                | (Created, Closing)
                | (Closing, Destroyed)
        )
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Active => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}
