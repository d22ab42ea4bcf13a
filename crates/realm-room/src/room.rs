//! The room entity and its read-only snapshot.

use std::collections::BTreeMap;

use realm_protocol::{RoomId, RoomState, RoomSummary};
use realm_scene::{LoadStrategy, WorldBinding};
use realm_transport::ConnectionId;

use crate::RoomSpec;

/// Where a room's workflow is parked while the scene queue works for it.
///
/// Scene completions resume from this record, never from captured
/// context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Suspension {
    /// First load after creation.
    InitialLoad,
    /// Old world unloading ahead of a segment change.
    UnloadForChange { next_segment: String },
    /// New world loading after a segment change.
    LoadForChange,
    /// World unloading ahead of destruction.
    Teardown,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A named session hosting up to `max_players` connections.
///
/// Rooms live in the [`RoomRegistry`](crate::RoomRegistry); everything
/// that changes a room goes through it.
#[derive(Debug, Clone)]
pub struct Room {
    pub(crate) id: RoomId,
    pub(crate) name: String,
    pub(crate) private: bool,
    pub(crate) access_token: Option<String>,
    pub(crate) max_players: usize,
    pub(crate) connections: Vec<ConnectionId>,
    pub(crate) world: Option<WorldBinding>,
    pub(crate) segment: Option<String>,
    pub(crate) strategy: LoadStrategy,
    pub(crate) custom_data: BTreeMap<String, String>,
    pub(crate) state: RoomState,
    pub(crate) destroy_when_empty: bool,
    pub(crate) category: Option<String>,
    pub(crate) created_seq: u64,
    pub(crate) suspended: Option<Suspension>,
    pub(crate) teardown_requested: bool,
}

impl Room {
    pub(crate) fn from_spec(id: RoomId, created_seq: u64, spec: &RoomSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            private: spec.private,
            access_token: spec.access_token.clone(),
            max_players: spec.max_players,
            connections: Vec::new(),
            world: None,
            segment: spec.segment.clone().filter(|s| !s.is_empty()),
            strategy: spec.strategy,
            custom_data: spec.custom_data.clone(),
            state: RoomState::Created,
            destroy_when_empty: spec.destroy_when_empty,
            category: spec.category.clone(),
            created_seq,
            suspended: None,
            teardown_requested: false,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// Bound connections, in join order.
    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    pub fn player_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_players
    }

    pub fn has_connection(&self, connection: ConnectionId) -> bool {
        self.connections.contains(&connection)
    }

    /// Handle to the loaded world. `Some` exactly while the room is
    /// `Active` or `Closing`.
    pub fn world(&self) -> Option<&WorldBinding> {
        self.world.as_ref()
    }

    /// Segment the room runs, or is loading.
    pub fn segment(&self) -> Option<&str> {
        self.segment.as_deref()
    }

    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    pub fn custom_data(&self) -> &BTreeMap<String, String> {
        &self.custom_data
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn destroy_when_empty(&self) -> bool {
        self.destroy_when_empty
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Monotonic creation counter; orders rooms oldest first.
    pub fn created_seq(&self) -> u64 {
        self.created_seq
    }

    pub(crate) fn suspension(&self) -> Option<&Suspension> {
        self.suspended.as_ref()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id,
            name: self.name.clone(),
            state: self.state,
            player_count: self.connections.len(),
            max_players: self.max_players,
            segment: self.segment.clone(),
            world: self.world.clone(),
            private: self.private,
            locked: self.access_token.is_some(),
            custom_data: self.custom_data.clone(),
            category: self.category.clone(),
            connections: self.connections.clone(),
            created_seq: self.created_seq,
        }
    }
}

// ---------------------------------------------------------------------------
// RoomInfo
// ---------------------------------------------------------------------------

/// Point-in-time copy of a room, safe to hand outside the server task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub name: String,
    pub state: RoomState,
    pub player_count: usize,
    pub max_players: usize,
    pub segment: Option<String>,
    pub world: Option<WorldBinding>,
    pub private: bool,
    /// An access token is required to join.
    pub locked: bool,
    pub custom_data: BTreeMap<String, String>,
    pub category: Option<String>,
    pub connections: Vec<ConnectionId>,
    pub created_seq: u64,
}

impl RoomInfo {
    pub fn is_full(&self) -> bool {
        self.player_count >= self.max_players
    }

    /// Wire form sent to clients. Connection ids stay server-side.
    pub fn to_summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id,
            name: self.name.clone(),
            state: self.state,
            player_count: self.player_count,
            max_players: self.max_players,
            segment: self.segment.clone(),
            private: self.private,
            custom_data: self.custom_data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_from_spec_starts_created_without_world() {
        let spec = RoomSpec::new("Arena", "Map1", 4).with_data("mode", "ctf");
        let room = Room::from_spec(RoomId(9), 1, &spec);
        assert_eq!(room.state(), RoomState::Created);
        assert!(room.world().is_none());
        assert_eq!(room.segment(), Some("Map1"));
        assert_eq!(room.custom_data().get("mode").map(String::as_str), Some("ctf"));
    }

    #[test]
    fn test_headless_room_has_no_segment() {
        let room = Room::from_spec(RoomId(1), 1, &RoomSpec::headless("Chat", 50));
        assert_eq!(room.segment(), None);
        assert_eq!(room.strategy(), LoadStrategy::None);
    }

    #[test]
    fn test_summary_hides_connections() {
        let mut room = Room::from_spec(RoomId(3), 1, &RoomSpec::headless("Chat", 2));
        room.connections.push(ConnectionId::new(7));
        let summary = room.info().to_summary();
        assert_eq!(summary.player_count, 1);
        assert_eq!(summary.name, "Chat");
    }
}
