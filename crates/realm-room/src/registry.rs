//! The authoritative table of rooms and connection bindings.
//!
//! The registry keeps three views of the same data and updates them
//! together:
//!
//! - rooms by id, which owns the [`Room`] values
//! - ids by name, so names stay unique and lookups by name are
//!   a single map hit
//! - the room of each bound connection, so "which room is this player
//!   in" does not scan every room
//!
//! Creation order is kept separately so listings are stable. Every method
//! that touches more than one view does so before returning, which means
//! a reader never sees a connection bound to a room that is not in the
//! table.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use realm_protocol::{RoomId, RoomState, RoomTarget};
use realm_scene::WorldBinding;
use realm_transport::ConnectionId;

use crate::room::Suspension;
use crate::{Room, RoomError, RoomSpec};

// ---------------------------------------------------------------------------
// RoomIdGenerator
// ---------------------------------------------------------------------------

/// Hands out random room ids that do not collide with any live room.
///
/// Ids are drawn from `1..=u32::MAX` so they stay short on the wire and
/// are not guessable from the creation order.
#[derive(Debug)]
pub struct RoomIdGenerator {
    rng: StdRng,
}

impl RoomIdGenerator {
    /// A generator seeded from the OS, or from `seed` for reproducible ids.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    /// Draws until `taken` rejects nothing.
    pub fn next_id(&mut self, taken: impl Fn(RoomId) -> bool) -> RoomId {
        loop {
            let id = RoomId(self.rng.random_range(1..=u64::from(u32::MAX)));
            if !taken(id) {
                return id;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RoomRegistry
// ---------------------------------------------------------------------------

/// Owns every [`Room`] and every connection binding.
///
/// The registry enforces the structural invariants: unique names, at most
/// one room per connection, `player_count <= max_players`, and bindings
/// only to `Active` rooms. It never loads or unloads worlds; the room
/// server drives that and records the results here.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    /// Room ids in creation order.
    order: Vec<RoomId>,
    names: HashMap<String, RoomId>,
    bindings: HashMap<ConnectionId, RoomId>,
    ids: RoomIdGenerator,
    next_seq: u64,
}

impl RoomRegistry {
    pub fn new(id_seed: Option<u64>) -> Self {
        Self {
            rooms: HashMap::new(),
            order: Vec::new(),
            names: HashMap::new(),
            bindings: HashMap::new(),
            ids: RoomIdGenerator::new(id_seed),
            next_seq: 1,
        }
    }

    /// Registers a room in the `Created` state.
    ///
    /// Does not start loading its world.
    ///
    /// # Errors
    /// [`RoomError::NameTaken`] if a live room already has the name. The
    /// registry is left unchanged.
    pub fn create_room(&mut self, spec: &RoomSpec) -> Result<&Room, RoomError> {
        if self.names.contains_key(&spec.name) {
            return Err(RoomError::NameTaken(spec.name.clone()));
        }

        let rooms = &self.rooms;
        let id = self.ids.next_id(|id| rooms.contains_key(&id));
        let seq = self.next_seq;
        self.next_seq += 1;

        self.names.insert(spec.name.clone(), id);
        self.order.push(id);
        tracing::debug!(room_id = %id, name = %spec.name, "room registered");
        Ok(self
            .rooms
            .entry(id)
            .or_insert_with(|| Room::from_spec(id, seq, spec)))
    }

    pub fn get(&self, id: RoomId) -> Option<&Room> {
        self.rooms.get(&id)
    }

    /// Looks a room up by id or name.
    pub fn get_room(&self, target: &RoomTarget) -> Result<&Room, RoomError> {
        let room = match target {
            RoomTarget::Id(id) => self.rooms.get(id),
            RoomTarget::Name(name) => self.names.get(name).and_then(|id| self.rooms.get(id)),
        };
        room.ok_or_else(|| RoomError::NotFound(target.clone()))
    }

    /// Removes an empty room and drops its world reference.
    ///
    /// The returned room is in the `Destroyed` state.
    ///
    /// # Errors
    /// [`RoomError::NotFound`] for an unknown id, [`RoomError::NotEmpty`]
    /// while connections are still bound.
    pub fn destroy_room(&mut self, id: RoomId) -> Result<Room, RoomError> {
        let room = self
            .rooms
            .get(&id)
            .ok_or(RoomError::NotFound(RoomTarget::Id(id)))?;
        if !room.connections.is_empty() {
            return Err(RoomError::NotEmpty(id, room.connections.len()));
        }

        let mut room = self
            .rooms
            .remove(&id)
            .ok_or(RoomError::NotFound(RoomTarget::Id(id)))?;
        self.names.remove(&room.name);
        self.order.retain(|r| *r != id);
        if let Some(world) = room.world.take() {
            tracing::debug!(room_id = %id, ?world, "world reference released");
        }
        room.state = RoomState::Destroyed;
        room.suspended = None;
        tracing::debug!(room_id = %id, name = %room.name, "room removed from registry");
        Ok(room)
    }

    /// Rooms matching `predicate`, oldest first.
    ///
    /// The iterator borrows the registry, so the set it walks cannot change
    /// underneath it.
    pub fn list_rooms<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a Room> + 'a
    where
        P: Fn(&Room) -> bool + 'a,
    {
        self.order
            .iter()
            .filter_map(|id| self.rooms.get(id))
            .filter(move |room| predicate(room))
    }

    /// Rooms running `segment`, oldest first.
    pub fn rooms_with_segment<'a>(&'a self, segment: &'a str) -> impl Iterator<Item = &'a Room> + 'a {
        self.list_rooms(move |room| room.segment() == Some(segment))
    }

    pub fn room_of_connection(&self, connection: ConnectionId) -> Option<&Room> {
        self.bindings
            .get(&connection)
            .and_then(|id| self.rooms.get(id))
    }

    /// Binds `connection` to an `Active` room with a free seat.
    ///
    /// # Errors
    /// [`RoomError::AlreadyInRoom`], [`RoomError::NotFound`],
    /// [`RoomError::NotJoinable`] or [`RoomError::Full`]. Nothing changes
    /// on error.
    pub fn bind(&mut self, connection: ConnectionId, id: RoomId) -> Result<&Room, RoomError> {
        if let Some(current) = self.bindings.get(&connection) {
            return Err(RoomError::AlreadyInRoom(connection, *current));
        }
        let room = self
            .rooms
            .get_mut(&id)
            .ok_or(RoomError::NotFound(RoomTarget::Id(id)))?;
        if !room.state.is_joinable() {
            return Err(RoomError::NotJoinable(id, room.state));
        }
        if room.is_full() {
            return Err(RoomError::Full(id));
        }

        room.connections.push(connection);
        self.bindings.insert(connection, id);
        Ok(room)
    }

    /// Removes `connection`'s binding and returns the room it left.
    ///
    /// # Errors
    /// [`RoomError::NotInRoom`] if the connection is not bound.
    pub fn unbind(&mut self, connection: ConnectionId) -> Result<&Room, RoomError> {
        let id = self
            .bindings
            .remove(&connection)
            .ok_or(RoomError::NotInRoom(connection))?;
        let room = self.rooms.get_mut(&id).unwrap_or_else(|| {
            panic!("{connection} was bound to {id}, which is not registered")
        });
        room.connections.retain(|c| *c != connection);
        Ok(room)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Number of bound connections across all rooms.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    // -- Mutation used by the room server ---------------------------------

    /// Moves a room to `to` and returns the state it left.
    ///
    /// # Panics
    /// On an unknown room or a transition the lifecycle does not allow.
    pub(crate) fn transition(&mut self, id: RoomId, to: RoomState) -> RoomState {
        let room = self.expect_mut(id);
        let from = room.state;
        assert!(
            from.can_transition_to(to),
            "invalid room transition {from} -> {to} for {id}"
        );
        room.state = to;
        tracing::info!(room_id = %id, %from, %to, "room state changed");
        from
    }

    /// Replaces the room's world reference and returns the previous one.
    pub(crate) fn set_world(&mut self, id: RoomId, world: Option<WorldBinding>) -> Option<WorldBinding> {
        std::mem::replace(&mut self.expect_mut(id).world, world)
    }

    pub(crate) fn set_segment(&mut self, id: RoomId, segment: Option<String>) {
        self.expect_mut(id).segment = segment;
    }

    pub(crate) fn suspend(&mut self, id: RoomId, suspension: Suspension) {
        let room = self.expect_mut(id);
        assert!(
            room.suspended.is_none(),
            "{id} suspended as {suspension:?} while already {:?}",
            room.suspended
        );
        room.suspended = Some(suspension);
    }

    pub(crate) fn take_suspension(&mut self, id: RoomId) -> Option<Suspension> {
        self.expect_mut(id).suspended.take()
    }

    pub(crate) fn request_teardown(&mut self, id: RoomId, requested: bool) {
        self.expect_mut(id).teardown_requested = requested;
    }

    /// Every room id currently registered, oldest first.
    pub(crate) fn ids(&self) -> Vec<RoomId> {
        self.order.clone()
    }

    fn expect_mut(&mut self, id: RoomId) -> &mut Room {
        self.rooms
            .get_mut(&id)
            .unwrap_or_else(|| panic!("room {id} is not registered"))
    }
}
