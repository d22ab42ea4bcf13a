//! The room server's state and its synchronous workflow steps.
//!
//! Every operation runs to completion inside one handler call. Where a
//! workflow has to wait for the scene queue, it records a [`Suspension`] on
//! the room and returns; the matching [`SceneCompletion`] resumes it from
//! that record after re-reading the room from the registry.

use std::collections::HashMap;

use realm_protocol::{MatchId, RoomId, RoomPage, RoomQuery, RoomState, RoomTarget};
use realm_router::EventBus;
use realm_scene::{
    LoadStrategy, SceneCompletion, SceneError, SceneOrchestrator, SceneOutcome, SceneTicket,
    WorldBackend, WorldBinding,
};
use realm_transport::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::matchmaking::{Criteria, MatchStrategy, MatchmakingEngine};
use crate::query::run_query;
use crate::room::Suspension;
use crate::server::Signal;
use crate::{
    Room, RoomAccessValidator, RoomError, RoomEvent, RoomInfo, RoomRegistry, RoomServerConfig,
    RoomSpec, RoomValidator, TemplateCatalog,
};

/// Where the outcome of a join goes.
pub(crate) enum JoinReply {
    /// A caller waiting on a handle.
    Client(oneshot::Sender<Result<RoomInfo, RoomError>>),
    /// A connection placed by matchmaking. Failures are only logged.
    Match(MatchId),
}

/// A join waiting for its room to finish loading.
pub(crate) struct ParkedJoin {
    id: u64,
    connection: ConnectionId,
    room: RoomId,
    /// Timer retries that found the room still loading.
    attempts: u32,
    reply: JoinReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitCause {
    Requested,
    Disconnected,
}

/// Seats a room has promised: bound connections plus parked joins.
fn occupancy(room: &Room, parked: &[ParkedJoin]) -> usize {
    room.player_count() + parked.iter().filter(|p| p.room == room.id()).count()
}

// ---------------------------------------------------------------------------
// RoomServer
// ---------------------------------------------------------------------------

pub(crate) struct RoomServer<B: WorldBackend> {
    pub(crate) config: RoomServerConfig,
    pub(crate) registry: RoomRegistry,
    pub(crate) scenes: SceneOrchestrator<B>,
    pub(crate) matchmaking: MatchmakingEngine,
    pub(crate) templates: TemplateCatalog,
    pub(crate) room_validators: Vec<Box<dyn RoomValidator>>,
    pub(crate) access_validators: Vec<Box<dyn RoomAccessValidator>>,
    pub(crate) events: EventBus<RoomEvent>,
    /// Loopback for retry timers.
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
    pub(crate) parked: Vec<ParkedJoin>,
    /// Disconnects held back until the connection's parked join is decided.
    pub(crate) deferred: HashMap<ConnectionId, Vec<oneshot::Sender<()>>>,
    pub(crate) next_join: u64,
}

impl<B: WorldBackend> RoomServer<B> {
    // -- Create -----------------------------------------------------------

    pub(crate) fn create_room(
        &mut self,
        requester: Option<ConnectionId>,
        spec: RoomSpec,
    ) -> Result<RoomInfo, RoomError> {
        spec.check()?;
        for validator in &self.room_validators {
            validator
                .validate_create(requester, &spec, &self.registry)
                .map_err(RoomError::AccessDenied)?;
        }

        let evict = match spec.strategy {
            LoadStrategy::Single => self.single_world_holder()?,
            _ => None,
        };

        let id = self.registry.create_room(&spec)?.id();
        tracing::info!(room_id = %id, name = %spec.name, segment = ?spec.segment, strategy = %spec.strategy, "room created");
        if let Some(holder) = evict {
            // Queued ahead of our load, so the old world is gone first.
            tracing::info!(room_id = %holder, replaced_by = %id, "tearing down empty room holding the single world");
            self.begin_teardown(holder);
        }
        self.set_state(id, RoomState::Loading);

        let segment = spec.segment.as_deref().unwrap_or_default();
        match self.scenes.request_load(id, segment, spec.strategy) {
            Ok(ticket) => self.await_scene(id, Suspension::InitialLoad, ticket),
            Err(err) => panic!("scene queue refused the first load of new room {id}: {err}"),
        }
        Ok(self.info(id))
    }

    pub(crate) fn create_from_template(
        &mut self,
        requester: Option<ConnectionId>,
        category: &str,
        name: String,
        capacity: Option<usize>,
    ) -> Result<RoomInfo, RoomError> {
        let spec = self.templates.get(category)?.instantiate(name, capacity)?;
        self.create_room(requester, spec)
    }

    /// Finds the room that owns the process-wide single world.
    ///
    /// Returns the holder if it may be torn down to make room: active,
    /// idle, disposable, and with no bound or parked connections. Rooms
    /// already closing have their unload queued and do not count.
    ///
    /// # Errors
    /// [`RoomError::Busy`] naming the holder when it must stay.
    fn single_world_holder(&self) -> Result<Option<RoomId>, RoomError> {
        let holder = self
            .registry
            .list_rooms(|room| {
                room.strategy() == LoadStrategy::Single && room.state() != RoomState::Closing
            })
            .next();
        let Some(room) = holder else {
            return Ok(None);
        };

        let id = room.id();
        let idle = room.state() == RoomState::Active
            && room.suspension().is_none()
            && !self.scenes.is_busy(id);
        if !idle || !room.destroy_when_empty() || occupancy(room, &self.parked) > 0 {
            tracing::debug!(room_id = %id, state = %room.state(), players = room.player_count(), "single world is in use");
            return Err(RoomError::Busy(id));
        }
        Ok(Some(id))
    }

    // -- Join -------------------------------------------------------------

    pub(crate) fn join_room(
        &mut self,
        connection: ConnectionId,
        target: &RoomTarget,
        token: Option<&str>,
        reply: JoinReply,
    ) {
        match self.admit(connection, target, token) {
            Ok(Admission::Bind(id)) => {
                let result = self.bind(connection, id);
                answer(reply, connection, result);
            }
            Ok(Admission::Park(id)) => self.park(connection, id, reply),
            Err(err) => {
                tracing::debug!(%connection, %target, %err, "join rejected");
                answer(reply, connection, Err(err));
            }
        }
    }

    fn admit(
        &self,
        connection: ConnectionId,
        target: &RoomTarget,
        token: Option<&str>,
    ) -> Result<Admission, RoomError> {
        if let Some(room) = self.registry.room_of_connection(connection) {
            return Err(RoomError::AlreadyInRoom(connection, room.id()));
        }
        if let Some(parked) = self.parked.iter().find(|p| p.connection == connection) {
            return Err(RoomError::AlreadyInRoom(connection, parked.room));
        }
        if let Some(ticket) = self.matchmaking.pending_ticket(connection) {
            return Err(RoomError::AlreadyMatching(connection, ticket));
        }

        let room = self.registry.get_room(target)?;
        for validator in &self.access_validators {
            validator
                .validate_join(room, connection, token)
                .map_err(RoomError::AccessDenied)?;
        }

        let id = room.id();
        let full = occupancy(room, &self.parked) >= room.max_players();
        match room.state() {
            RoomState::Active if full => Err(RoomError::Full(id)),
            RoomState::Active => Ok(Admission::Bind(id)),
            RoomState::Created | RoomState::Loading if full => Err(RoomError::Full(id)),
            RoomState::Created | RoomState::Loading => Ok(Admission::Park(id)),
            state @ (RoomState::Closing | RoomState::Destroyed) => {
                Err(RoomError::NotJoinable(id, state))
            }
        }
    }

    fn bind(&mut self, connection: ConnectionId, id: RoomId) -> Result<RoomInfo, RoomError> {
        let room = self.registry.bind(connection, id)?;
        let players = room.player_count();
        let info = room.info();
        tracing::info!(%connection, room_id = %id, players, "connection joined room");
        self.events.publish(RoomEvent::JoinedRoom {
            connection,
            room: id,
            players,
        });
        Ok(info)
    }

    fn park(&mut self, connection: ConnectionId, room: RoomId, reply: JoinReply) {
        let id = self.next_join;
        self.next_join += 1;
        self.parked.push(ParkedJoin {
            id,
            connection,
            room,
            attempts: 0,
            reply,
        });
        tracing::debug!(%connection, room_id = %room, "join parked until the room is active");
        self.schedule_retry(id);
    }

    fn schedule_retry(&self, join: u64) {
        let signals = self.signals.clone();
        let delay = self.config.join_retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(Signal::RetryJoin(join));
        });
    }

    /// Timer retry of a parked join.
    pub(crate) fn retry_join(&mut self, join: u64) {
        let Some(index) = self.parked.iter().position(|p| p.id == join) else {
            return;
        };
        let room_id = self.parked[index].room;
        let pending = self
            .registry
            .get(room_id)
            .is_some_and(|room| room.state().is_pending());
        if !pending {
            self.settle(index, None);
            return;
        }

        let limit = self.config.join_retry_limit;
        let parked = &mut self.parked[index];
        parked.attempts += 1;
        if parked.attempts >= limit {
            tracing::warn!(connection = %parked.connection, room_id = %room_id, attempts = parked.attempts, "join timed out waiting for room");
            self.settle(index, Some(RoomError::Timeout(room_id)));
        } else {
            tracing::debug!(connection = %parked.connection, room_id = %room_id, attempts = parked.attempts, "room still loading, join retry scheduled");
            self.schedule_retry(join);
        }
    }

    /// Decides a parked join: fails it with `error`, or binds it if the
    /// room is active now.
    fn settle(&mut self, index: usize, error: Option<RoomError>) {
        let parked = self.parked.remove(index);
        let result = match error {
            Some(err) => Err(err),
            None => match self.registry.get(parked.room).map(Room::state) {
                None => Err(RoomError::NotFound(RoomTarget::Id(parked.room))),
                Some(RoomState::Active) => self.bind(parked.connection, parked.room),
                Some(state) => Err(RoomError::NotJoinable(parked.room, state)),
            },
        };
        answer(parked.reply, parked.connection, result);
        self.flush_deferred(parked.connection);
    }

    fn wake_parked(&mut self, room: RoomId) {
        while let Some(index) = self.parked.iter().position(|p| p.room == room) {
            self.settle(index, None);
        }
    }

    fn fail_parked(&mut self, room: RoomId) {
        while let Some(index) = self.parked.iter().position(|p| p.room == room) {
            self.settle(index, Some(RoomError::NotFound(RoomTarget::Id(room))));
        }
    }

    // -- Exit and disconnect ----------------------------------------------

    pub(crate) fn exit_room(
        &mut self,
        connection: ConnectionId,
        destroy_if_empty: bool,
        cause: ExitCause,
    ) -> Result<RoomInfo, RoomError> {
        let room = self.registry.unbind(connection)?;
        let id = room.id();
        let players = room.player_count();
        let teardown = players == 0 && destroy_if_empty && room.destroy_when_empty();
        let info = room.info();

        tracing::info!(%connection, room_id = %id, players, ?cause, "connection left room");
        self.events.publish(match cause {
            ExitCause::Requested => RoomEvent::ExitedRoom {
                connection,
                room: id,
                players,
            },
            ExitCause::Disconnected => RoomEvent::DisconnectedRoom {
                connection,
                room: id,
                players,
            },
        });

        if teardown {
            self.begin_teardown(id);
        }
        Ok(info)
    }

    /// Implicit exit for a dropped connection. Never fails.
    pub(crate) fn disconnect(&mut self, connection: ConnectionId, reply: Option<oneshot::Sender<()>>) {
        if self.parked.iter().any(|p| p.connection == connection) {
            tracing::debug!(%connection, "disconnect deferred until the pending join is decided");
            self.deferred.entry(connection).or_default().extend(reply);
            return;
        }
        self.disconnect_now(connection);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn disconnect_now(&mut self, connection: ConnectionId) {
        self.matchmaking.forget_connection(connection);
        match self.exit_room(connection, true, ExitCause::Disconnected) {
            Ok(_) | Err(RoomError::NotInRoom(_)) => {}
            Err(err) => tracing::error!(%connection, %err, "disconnect cleanup failed"),
        }
    }

    fn flush_deferred(&mut self, connection: ConnectionId) {
        if let Some(waiters) = self.deferred.remove(&connection) {
            self.disconnect_now(connection);
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    // -- World changes ----------------------------------------------------

    pub(crate) fn change_world_segment(
        &mut self,
        target: &RoomTarget,
        segment: String,
        keep_players: bool,
    ) -> Result<(), RoomError> {
        let room = self.registry.get_room(target)?;
        let id = room.id();
        if room.state() != RoomState::Active
            || room.suspension().is_some()
            || self.scenes.is_busy(id)
        {
            return Err(RoomError::Busy(id));
        }
        if room.strategy() == LoadStrategy::None {
            return Err(RoomError::InvalidSpec(format!(
                "room {id} is headless and has no world segment to change"
            )));
        }
        if segment.trim().is_empty() {
            return Err(RoomError::InvalidSpec("world segment name is empty".into()));
        }

        if !keep_players {
            for connection in room.connections().to_vec() {
                self.exit_room(connection, false, ExitCause::Requested)?;
            }
        }

        let Some(world) = self.registry.set_world(id, None) else {
            panic!("active room {id} has no world");
        };
        tracing::info!(room_id = %id, from = ?world.segment_name(), to = %segment, keep_players, "changing world segment");
        self.set_state(id, RoomState::Loading);
        match self.scenes.request_unload(id, world) {
            Ok(ticket) => self.await_scene(
                id,
                Suspension::UnloadForChange {
                    next_segment: segment,
                },
                ticket,
            ),
            Err(err) => panic!("scene queue refused to unload idle room {id}: {err}"),
        }
        Ok(())
    }

    fn load_next_segment(&mut self, id: RoomId, segment: String) {
        let strategy = self.room(id).strategy();
        self.registry.set_segment(id, Some(segment.clone()));
        match self.scenes.request_load(id, &segment, strategy) {
            Ok(ticket) => self.await_scene(id, Suspension::LoadForChange, ticket),
            Err(err) => panic!("scene queue refused to load {segment} for unloaded room {id}: {err}"),
        }
    }

    // -- Teardown ---------------------------------------------------------

    /// Starts unload-then-destroy, or flags the room if it is mid-change.
    fn begin_teardown(&mut self, id: RoomId) {
        let room = self.room(id);
        if room.state() != RoomState::Active
            || room.suspension().is_some()
            || self.scenes.is_busy(id)
        {
            tracing::debug!(room_id = %id, state = %room.state(), "teardown deferred until the room settles");
            self.registry.request_teardown(id, true);
            return;
        }
        let Some(world) = room.world().cloned() else {
            panic!("active room {id} has no world");
        };

        self.set_state(id, RoomState::Closing);
        match self.scenes.request_unload(id, world) {
            Ok(ticket) => self.await_scene(id, Suspension::Teardown, ticket),
            Err(err) => panic!("scene queue refused to unload idle room {id}: {err}"),
        }
    }

    /// Supervisor close. Unbinds everyone and destroys the room, unloading
    /// its world first if it has a live one.
    pub(crate) fn close_room(&mut self, id: RoomId) -> Result<(), RoomError> {
        let room = self
            .registry
            .get(id)
            .ok_or(RoomError::NotFound(RoomTarget::Id(id)))?;
        if self.scenes.is_busy(id) {
            return Err(RoomError::Busy(id));
        }

        tracing::info!(room_id = %id, state = %room.state(), players = room.player_count(), "force closing room");
        for connection in room.connections().to_vec() {
            self.exit_room(connection, false, ExitCause::Requested)?;
        }
        self.fail_parked(id);

        // Exits and failed joins may have run deferred disconnects.
        let Some(room) = self.registry.get(id) else {
            return Ok(());
        };
        match room.state() {
            RoomState::Active => {
                self.registry.request_teardown(id, false);
                self.begin_teardown(id);
            }
            RoomState::Created | RoomState::Loading => {
                self.set_state(id, RoomState::Closing);
                self.destroy(id);
            }
            RoomState::Closing => {
                tracing::warn!(room_id = %id, "destroying room whose world could not be unloaded");
                self.destroy(id);
            }
            RoomState::Destroyed => {}
        }
        Ok(())
    }

    fn destroy(&mut self, id: RoomId) {
        self.scenes.release(id);
        let room = self
            .registry
            .destroy_room(id)
            .unwrap_or_else(|err| panic!("closing room {id} could not be destroyed: {err}"));
        tracing::info!(room_id = %id, name = %room.name(), "room destroyed");
        self.events.publish(RoomEvent::StateChanged {
            room: id,
            from: RoomState::Closing,
            to: RoomState::Destroyed,
        });
    }

    // -- Scene completions ------------------------------------------------

    pub(crate) fn on_scene_completion(&mut self, completion: SceneCompletion) {
        self.scenes.complete(&completion);
        self.resume(completion.room, completion.outcome);
    }

    /// Records the suspension, then resumes at once if the scene queue
    /// already finished the work.
    fn await_scene(&mut self, id: RoomId, suspension: Suspension, ticket: SceneTicket) {
        self.registry.suspend(id, suspension);
        if let SceneTicket::Completed(outcome) = ticket {
            self.resume(id, outcome);
        }
    }

    /// Continues whatever workflow the room is suspended in.
    ///
    /// # Panics
    /// If the room is unknown or the outcome does not fit its suspension.
    fn resume(&mut self, id: RoomId, outcome: SceneOutcome) {
        let suspension = self.registry.take_suspension(id);
        match (suspension, outcome) {
            (Some(Suspension::InitialLoad), SceneOutcome::Loaded(world)) => {
                self.activate(id, world, true);
            }
            (Some(Suspension::LoadForChange), SceneOutcome::Loaded(world)) => {
                self.activate(id, world, false);
            }
            (Some(Suspension::UnloadForChange { next_segment }), SceneOutcome::Unloaded) => {
                self.load_next_segment(id, next_segment);
            }
            (Some(Suspension::Teardown), SceneOutcome::Unloaded) => self.destroy(id),
            (
                Some(Suspension::InitialLoad | Suspension::LoadForChange | Suspension::UnloadForChange { .. }),
                SceneOutcome::Failed(err),
            ) => {
                tracing::error!(room_id = %id, %err, "world transition failed, room left loading");
                self.scene_failed(id, &err);
            }
            (Some(Suspension::Teardown), SceneOutcome::Failed(err)) => {
                tracing::error!(room_id = %id, %err, "world unload failed during teardown, segment leaked");
                self.scene_failed(id, &err);
            }
            (suspension, outcome) => {
                panic!("room {id} resumed with {outcome:?} while suspended as {suspension:?}")
            }
        }
    }

    fn activate(&mut self, id: RoomId, world: WorldBinding, created: bool) {
        self.registry.set_world(id, Some(world));
        self.set_state(id, RoomState::Active);
        if created {
            let info = self.info(id);
            self.events.publish(RoomEvent::CreatedRoom(info));
        }
        self.wake_parked(id);

        let Some(room) = self.registry.get(id) else {
            return;
        };
        let teardown = room.teardown_requested
            && room.state() == RoomState::Active
            && room.player_count() == 0;
        self.registry.request_teardown(id, false);
        if teardown {
            self.begin_teardown(id);
        }
    }

    fn scene_failed(&mut self, id: RoomId, err: &SceneError) {
        self.events.publish(RoomEvent::SceneFailed {
            room: id,
            reason: err.to_string(),
        });
    }

    // -- Matchmaking ------------------------------------------------------

    pub(crate) fn submit_match(
        &mut self,
        connections: Vec<ConnectionId>,
        strategy: MatchStrategy,
        criteria: Criteria,
    ) -> Result<MatchId, RoomError> {
        for connection in &connections {
            if let Some(room) = self.registry.room_of_connection(*connection) {
                return Err(RoomError::AlreadyInRoom(*connection, room.id()));
            }
            if let Some(parked) = self.parked.iter().find(|p| p.connection == *connection) {
                return Err(RoomError::AlreadyInRoom(*connection, parked.room));
            }
        }
        let ticket = self
            .matchmaking
            .submit(connections, strategy, criteria, Instant::now())?;
        self.run_matchmaking();
        Ok(ticket)
    }

    pub(crate) fn cancel_match(&mut self, ticket: MatchId) -> bool {
        let cancelled = self.matchmaking.cancel(ticket);
        tracing::debug!(%ticket, cancelled, "match request cancelled");
        cancelled
    }

    /// One matchmaking pass: retire finished requests, then place every
    /// unplaced one first-fit, creating rooms where nothing fits.
    pub(crate) fn run_matchmaking(&mut self) {
        for expired in self.matchmaking.retire(&self.registry, Instant::now()) {
            self.events.publish(RoomEvent::MatchExpired {
                ticket: expired.ticket,
                connections: expired.connections,
            });
        }

        for ticket in self.matchmaking.unplaced() {
            let parked = &self.parked;
            let found = self
                .matchmaking
                .find_room(ticket, &self.registry, |room| occupancy(room, parked));
            let room = match found {
                Some(room) => room,
                None => {
                    let Some(spec) = self.matchmaking.room_spec(ticket) else {
                        continue;
                    };
                    match self.create_room(None, spec) {
                        Ok(info) => info.room_id,
                        Err(err) => {
                            tracing::warn!(%ticket, %err, "could not create a room for match request");
                            continue;
                        }
                    }
                }
            };

            self.matchmaking.mark_placed(ticket, room);
            let connections = self
                .matchmaking
                .request(ticket)
                .map(|r| r.connections.clone())
                .unwrap_or_default();
            let target = RoomTarget::Id(room);
            for connection in &connections {
                self.join_room(*connection, &target, None, JoinReply::Match(ticket));
            }
            tracing::info!(%ticket, room_id = %room, group = connections.len(), "match request placed");
            self.events.publish(RoomEvent::MatchPlaced {
                ticket,
                room,
                connections,
            });
        }
    }

    // -- Queries ----------------------------------------------------------

    pub(crate) fn get_room(&self, target: &RoomTarget) -> Result<RoomInfo, RoomError> {
        self.registry.get_room(target).map(Room::info)
    }

    pub(crate) fn list_rooms(&self, predicate: &dyn Fn(&RoomInfo) -> bool) -> Vec<RoomInfo> {
        self.registry
            .list_rooms(|_| true)
            .map(Room::info)
            .filter(|info| predicate(info))
            .collect()
    }

    pub(crate) fn query_rooms(&self, query: &RoomQuery) -> RoomPage {
        run_query(&self.registry, query, self.config.max_page_size)
    }

    pub(crate) fn room_of_connection(&self, connection: ConnectionId) -> Option<RoomInfo> {
        self.registry.room_of_connection(connection).map(Room::info)
    }

    // -- Helpers ----------------------------------------------------------

    fn set_state(&mut self, id: RoomId, to: RoomState) {
        let from = self.registry.transition(id, to);
        self.events
            .publish(RoomEvent::StateChanged { room: id, from, to });
    }

    fn room(&self, id: RoomId) -> &Room {
        self.registry
            .get(id)
            .unwrap_or_else(|| panic!("room {id} is not registered"))
    }

    fn info(&self, id: RoomId) -> RoomInfo {
        self.room(id).info()
    }
}

enum Admission {
    Bind(RoomId),
    Park(RoomId),
}

fn answer(reply: JoinReply, connection: ConnectionId, result: Result<RoomInfo, RoomError>) {
    match reply {
        JoinReply::Client(tx) => {
            let _ = tx.send(result);
        }
        JoinReply::Match(ticket) => {
            if let Err(err) = result {
                tracing::warn!(%ticket, %connection, %err, "matched connection could not join");
            }
        }
    }
}
