//! Queue of pending match requests and first-fit room placement.
//!
//! The engine is pure bookkeeping. The room server drives it: on every
//! submission and every tick it asks for a room per unplaced request,
//! creates one from the match template when none fits, joins the
//! request's connections, and retires requests whose room filled up or
//! went away.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use realm_protocol::{MatchId, RoomId, RoomState};
use realm_transport::ConnectionId;
use tokio::time::Instant;

use crate::{MatchmakingConfig, Room, RoomError, RoomRegistry, RoomSpec, RoomTemplate};

/// Key/value attributes a request wants in its room.
pub type Criteria = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Custom placement rules.
pub trait RoomMatcher: Send + Sync + 'static {
    /// Returns `true` if `room` suits `criteria`. Must be pure.
    fn find(&self, room: &Room, criteria: &Criteria) -> bool;

    /// Builds the [`RoomSpec`] for a fresh room when nothing fits.
    ///
    /// The default names the room after the template category and the
    /// ticket and copies the criteria into its custom data.
    fn create(&self, ticket: MatchId, criteria: &Criteria, template: &RoomTemplate) -> RoomSpec {
        tagged_room_spec(ticket, criteria, template)
    }
}

/// How a request picks its room.
#[derive(Clone, Default)]
pub enum MatchStrategy {
    /// Any open room with enough seats.
    #[default]
    Any,
    /// Every criteria pair must appear in the room's custom data.
    Attributes,
    Custom(Arc<dyn RoomMatcher>),
}

impl MatchStrategy {
    pub fn custom(matcher: impl RoomMatcher) -> Self {
        Self::Custom(Arc::new(matcher))
    }

    fn find(&self, room: &Room, criteria: &Criteria) -> bool {
        match self {
            Self::Any => true,
            Self::Attributes => criteria
                .iter()
                .all(|(key, value)| room.custom_data().get(key) == Some(value)),
            Self::Custom(matcher) => matcher.find(room, criteria),
        }
    }

    fn create(&self, ticket: MatchId, criteria: &Criteria, template: &RoomTemplate) -> RoomSpec {
        match self {
            Self::Any | Self::Attributes => tagged_room_spec(ticket, criteria, template),
            Self::Custom(matcher) => matcher.create(ticket, criteria, template),
        }
    }
}

impl fmt::Debug for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Attributes => write!(f, "Attributes"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

fn tagged_room_spec(ticket: MatchId, criteria: &Criteria, template: &RoomTemplate) -> RoomSpec {
    let mut custom_data = criteria.clone();
    custom_data.insert("match_ticket".to_owned(), ticket.to_string());
    RoomSpec {
        name: format!("{}-{ticket}", template.category),
        segment: template.segment.clone(),
        strategy: template.strategy,
        max_players: template.max_players,
        private: false,
        access_token: None,
        custom_data,
        destroy_when_empty: template.destroy_when_empty,
        category: Some(template.category.clone()),
    }
}

// ---------------------------------------------------------------------------
// MatchRequest
// ---------------------------------------------------------------------------

/// Connections waiting to be placed together.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub ticket: MatchId,
    pub connections: Vec<ConnectionId>,
    pub strategy: MatchStrategy,
    pub criteria: Criteria,
    pub submitted_at: Instant,
    /// Room the request was placed into, once placed.
    pub room: Option<RoomId>,
}

// ---------------------------------------------------------------------------
// MatchmakingEngine
// ---------------------------------------------------------------------------

pub struct MatchmakingEngine {
    config: MatchmakingConfig,
    /// Submission order; first-fit walks it front to back.
    requests: Vec<MatchRequest>,
    next_ticket: u64,
}

impl MatchmakingEngine {
    pub fn new(config: MatchmakingConfig) -> Self {
        Self {
            config,
            requests: Vec::new(),
            next_ticket: 1,
        }
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    /// Queues a request.
    ///
    /// Only checks the engine's own queue; the caller checks that none of
    /// the connections is bound or waiting to join.
    ///
    /// # Errors
    /// [`RoomError::InvalidSpec`] for an empty group or one too large for
    /// the match template, [`RoomError::AlreadyMatching`] if a connection
    /// already waits in another request.
    pub fn submit(
        &mut self,
        connections: Vec<ConnectionId>,
        strategy: MatchStrategy,
        criteria: Criteria,
        now: Instant,
    ) -> Result<MatchId, RoomError> {
        if connections.is_empty() {
            return Err(RoomError::InvalidSpec("match request has no connections".into()));
        }
        let capacity = self.config.room_template.max_players;
        if connections.len() > capacity {
            return Err(RoomError::InvalidSpec(format!(
                "group of {} does not fit match rooms of {capacity}",
                connections.len()
            )));
        }
        for (i, connection) in connections.iter().enumerate() {
            if connections[..i].contains(connection) {
                return Err(RoomError::InvalidSpec(format!(
                    "{connection} listed twice in match request"
                )));
            }
            if let Some(ticket) = self.pending_ticket(*connection) {
                return Err(RoomError::AlreadyMatching(*connection, ticket));
            }
        }

        let ticket = MatchId(self.next_ticket);
        self.next_ticket += 1;
        tracing::debug!(%ticket, group = connections.len(), ?strategy, "match request queued");
        self.requests.push(MatchRequest {
            ticket,
            connections,
            strategy,
            criteria,
            submitted_at: now,
            room: None,
        });
        Ok(ticket)
    }

    /// Removes a request. Returns `false` for an unknown ticket.
    pub fn cancel(&mut self, ticket: MatchId) -> bool {
        let before = self.requests.len();
        self.requests.retain(|r| r.ticket != ticket);
        before != self.requests.len()
    }

    /// Drops `connection` from any request; requests left empty go too.
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        for request in &mut self.requests {
            request.connections.retain(|c| *c != connection);
        }
        self.requests.retain(|r| !r.connections.is_empty());
    }

    /// Ticket of the unplaced request `connection` waits in.
    pub fn pending_ticket(&self, connection: ConnectionId) -> Option<MatchId> {
        self.requests
            .iter()
            .find(|r| r.room.is_none() && r.connections.contains(&connection))
            .map(|r| r.ticket)
    }

    /// Unplaced tickets in submission order.
    pub fn unplaced(&self) -> Vec<MatchId> {
        self.requests
            .iter()
            .filter(|r| r.room.is_none())
            .map(|r| r.ticket)
            .collect()
    }

    pub fn request(&self, ticket: MatchId) -> Option<&MatchRequest> {
        self.requests.iter().find(|r| r.ticket == ticket)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// First room, in registry order, that can take the whole request.
    ///
    /// `occupancy` reports the seats a room has promised, counting joins
    /// still waiting for its load to finish.
    pub fn find_room(
        &self,
        ticket: MatchId,
        registry: &RoomRegistry,
        occupancy: impl Fn(&Room) -> usize,
    ) -> Option<RoomId> {
        let request = self.request(ticket)?;
        let group = request.connections.len();
        registry
            .list_rooms(|room| {
                is_candidate(room)
                    && occupancy(room) + group <= room.max_players()
                    && request.strategy.find(room, &request.criteria)
            })
            .map(Room::id)
            .next()
    }

    /// Spec for a fresh room to host `ticket`.
    pub fn room_spec(&self, ticket: MatchId) -> Option<RoomSpec> {
        let request = self.request(ticket)?;
        Some(
            request
                .strategy
                .create(ticket, &request.criteria, &self.config.room_template),
        )
    }

    pub fn mark_placed(&mut self, ticket: MatchId, room: RoomId) {
        if let Some(request) = self.requests.iter_mut().find(|r| r.ticket == ticket) {
            request.room = Some(room);
        }
    }

    /// Drops requests whose room filled up or vanished, and unplaced ones
    /// older than the request timeout. Returns the expired unplaced ones.
    pub fn retire(&mut self, registry: &RoomRegistry, now: Instant) -> Vec<MatchRequest> {
        let timeout = self.config.request_timeout;
        let mut expired = Vec::new();
        self.requests.retain(|request| {
            match request.room {
                Some(id) => match registry.get(id) {
                    Some(room) if !room.is_full() => {
                        now.duration_since(request.submitted_at) < timeout
                    }
                    Some(_) => {
                        tracing::debug!(ticket = %request.ticket, room_id = %id, "match room filled");
                        false
                    }
                    None => false,
                },
                None if now.duration_since(request.submitted_at) >= timeout => {
                    tracing::info!(ticket = %request.ticket, "match request expired");
                    expired.push(request.clone());
                    false
                }
                None => true,
            }
        });
        expired
    }
}

/// Open to matchmaking: public, unlocked, and loaded or loading.
fn is_candidate(room: &Room) -> bool {
    !room.is_private()
        && room.access_token().is_none()
        && matches!(room.state(), RoomState::Loading | RoomState::Active)
        && !room.teardown_requested
}
