//! Outbound fan-out: the live connection table and the room delta
//! broadcaster.
//!
//! Every handler registers an outbound queue here. The broadcaster turns
//! room events into [`RoomUpdated`](ServerMessage::RoomUpdated) deltas for
//! connections that announced `Ready`, and tells matched connections where
//! their match landed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use realm_protocol::{ErrorCode, MatchId, RoomDelta, ServerMessage};
use realm_room::{RoomEvent, RoomServerHandle};
use realm_transport::ConnectionId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// ConnectionTable
// ---------------------------------------------------------------------------

struct Peer {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    ready: bool,
    /// Tickets this connection submitted and may cancel.
    tickets: HashSet<MatchId>,
    /// Match submissions still waiting for their ticket.
    submitting: usize,
    /// Match outcomes that arrived while a submission was in flight.
    held: Vec<(MatchId, ServerMessage)>,
}

impl Peer {
    fn flush_held(&mut self) {
        for (_, message) in self.held.drain(..) {
            let _ = self.outbound.send(message);
        }
    }
}

/// Outbound queues of every live connection, keyed by id.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    peers: Mutex<HashMap<ConnectionId, Peer>>,
}

impl ConnectionTable {
    fn peers(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let peer = Peer {
            outbound,
            ready: false,
            tickets: HashSet::new(),
            submitting: 0,
            held: Vec::new(),
        };
        if self.peers().insert(connection, peer).is_some() {
            tracing::warn!(%connection, "connection registered twice");
        }
    }

    /// Forgets `connection`, closing its outbound queue.
    pub(crate) fn remove(&self, connection: ConnectionId) -> bool {
        self.peers().remove(&connection).is_some()
    }

    /// Opts `connection` into room broadcasts. `false` if it already was.
    pub(crate) fn mark_ready(&self, connection: ConnectionId) -> bool {
        match self.peers().get_mut(&connection) {
            Some(peer) if !peer.ready => {
                peer.ready = true;
                true
            }
            _ => false,
        }
    }

    /// Queues `message` for one connection. `false` if it is gone.
    pub(crate) fn send(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        self.peers()
            .get(&connection)
            .is_some_and(|peer| peer.outbound.send(message).is_ok())
    }

    /// Queues `message` for every ready connection. Returns how many took it.
    pub(crate) fn broadcast(&self, message: &ServerMessage) -> usize {
        self.peers()
            .values()
            .filter(|peer| peer.ready)
            .filter(|peer| peer.outbound.send(message.clone()).is_ok())
            .count()
    }

    // -- Match tickets ----------------------------------------------------
    //
    // A submission may be placed before its ticket reaches the handler, so
    // the broadcaster holds outcomes for a connection with a submission in
    // flight. The handler then queues `MatchQueued` ahead of them.

    /// Notes that `connection` is waiting on a match submission.
    pub(crate) fn begin_submit(&self, connection: ConnectionId) {
        if let Some(peer) = self.peers().get_mut(&connection) {
            peer.submitting += 1;
        }
    }

    /// Finishes a submission: queues `reply`, then either releases an
    /// outcome already held for `ticket` or records the claim for later.
    pub(crate) fn claim_ticket(
        &self,
        connection: ConnectionId,
        ticket: MatchId,
        reply: ServerMessage,
    ) {
        let mut peers = self.peers();
        let Some(peer) = peers.get_mut(&connection) else {
            return;
        };
        peer.submitting = peer.submitting.saturating_sub(1);
        let _ = peer.outbound.send(reply);

        match peer.held.iter().position(|(held, _)| *held == ticket) {
            Some(index) => {
                let (_, outcome) = peer.held.remove(index);
                let _ = peer.outbound.send(outcome);
            }
            None => {
                peer.tickets.insert(ticket);
            }
        }
        if peer.submitting == 0 {
            peer.flush_held();
        }
    }

    /// Finishes a submission that produced no ticket.
    pub(crate) fn abandon_submit(&self, connection: ConnectionId) {
        if let Some(peer) = self.peers().get_mut(&connection) {
            peer.submitting = peer.submitting.saturating_sub(1);
            if peer.submitting == 0 {
                peer.flush_held();
            }
        }
    }

    /// Delivers the outcome of `ticket`, holding it back while the
    /// connection still waits for a ticket of its own.
    pub(crate) fn settle_ticket(
        &self,
        connection: ConnectionId,
        ticket: MatchId,
        outcome: ServerMessage,
    ) {
        let mut peers = self.peers();
        let Some(peer) = peers.get_mut(&connection) else {
            return;
        };
        if !peer.tickets.remove(&ticket) && peer.submitting > 0 {
            tracing::trace!(%connection, %ticket, "match outcome held until the ticket is claimed");
            peer.held.push((ticket, outcome));
            return;
        }
        let _ = peer.outbound.send(outcome);
    }

    /// Drops `connection`'s claim on `ticket`. `false` if it held none.
    pub(crate) fn release_ticket(&self, connection: ConnectionId, ticket: MatchId) -> bool {
        self.peers()
            .get_mut(&connection)
            .is_some_and(|peer| peer.tickets.remove(&ticket))
    }

    pub(crate) fn len(&self) -> usize {
        self.peers().len()
    }
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// The lobby-visible change an event represents, if any.
pub(crate) fn delta_for(event: &RoomEvent) -> Option<RoomDelta> {
    match event {
        RoomEvent::CreatedRoom(info) => Some(RoomDelta {
            room_id: info.room_id,
            player_count: Some(info.player_count),
            state: Some(info.state),
            segment: info.segment.clone(),
        }),
        RoomEvent::JoinedRoom { room, players, .. }
        | RoomEvent::ExitedRoom { room, players, .. }
        | RoomEvent::DisconnectedRoom { room, players, .. } => {
            Some(RoomDelta::players(*room, *players))
        }
        RoomEvent::StateChanged { room, to, .. } => Some(RoomDelta::state(*room, *to)),
        RoomEvent::SceneFailed { .. }
        | RoomEvent::MatchPlaced { .. }
        | RoomEvent::MatchExpired { .. } => None,
    }
}

/// Spawns the task that forwards room events to connected clients.
///
/// Ends when the room server shuts down.
pub(crate) fn spawn_broadcaster(
    rooms: &RoomServerHandle,
    table: Arc<ConnectionTable>,
) -> JoinHandle<()> {
    let mut events = rooms.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(delta) = delta_for(&event) {
                let reached = table.broadcast(&ServerMessage::RoomUpdated { delta });
                tracing::trace!(reached, "room delta broadcast");
                continue;
            }
            match event {
                RoomEvent::MatchPlaced {
                    ticket,
                    room,
                    connections,
                } => {
                    for connection in connections {
                        table.settle_ticket(
                            connection,
                            ticket,
                            ServerMessage::MatchFound {
                                ticket,
                                room_id: room,
                            },
                        );
                    }
                }
                RoomEvent::MatchExpired {
                    ticket,
                    connections,
                } => {
                    for connection in connections {
                        table.settle_ticket(
                            connection,
                            ticket,
                            ServerMessage::error(
                                ErrorCode::Timeout,
                                format!("match {ticket} expired"),
                            ),
                        );
                    }
                }
                RoomEvent::SceneFailed { room, reason } => {
                    tracing::debug!(room_id = %room, %reason, "scene failure not broadcast");
                }
                _ => {}
            }
        }
        tracing::debug!("room event stream closed, broadcaster stopping");
    })
}
