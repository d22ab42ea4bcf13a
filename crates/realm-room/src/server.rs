//! The room server task and the handle used to talk to it.
//!
//! ## Actor model
//!
//! All room state (the registry, the scene queue, the matchmaking queue)
//! is owned by one Tokio task. Nothing else holds a reference to it.
//! Callers get a [`RoomServerHandle`], which is just an `mpsc` sender:
//! every method packs its arguments into a command, attaches a `oneshot`
//! sender for the answer, and awaits the reply.
//!
//! ```text
//! RoomServerHandle ──Command──► room server task ──► RoomRegistry
//!        ▲                       │      ▲             SceneOrchestrator
//!        └──────oneshot reply────┘      │             MatchmakingEngine
//!                                       │
//!             scene completions, timers ┘
//! ```
//!
//! Because one task applies every command in order, there are no locks
//! around room state and no two operations can interleave halfway. A
//! workflow that must wait (a world load, a join into a loading room)
//! records where it stopped and returns; the task keeps serving other
//! commands until the completion or timer arrives on its own channel.
//!
//! Disconnects arrive through [`RoomServerHandle::notify_disconnect`],
//! which is synchronous so it can be called from a router subscriber.

use std::collections::HashMap;

use realm_protocol::{MatchId, RoomId, RoomPage, RoomQuery, RoomTarget};
use realm_router::{EventBus, EventStream};
use realm_scene::{SceneCompletions, SceneOrchestrator, WorldBackend};
use realm_transport::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::matchmaking::{Criteria, MatchStrategy, MatchmakingEngine};
use crate::workflow::{ExitCause, JoinReply, RoomServer};
use crate::{
    CapacityValidator, PasswordValidator, RoomAccessValidator, RoomError, RoomEvent, RoomInfo,
    RoomRegistry, RoomServerConfig, RoomSpec, RoomTemplate, RoomValidator, TemplateCatalog,
};

type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

/// Requests sent through a [`RoomServerHandle`].
pub(crate) enum Command {
    Create {
        requester: Option<ConnectionId>,
        spec: RoomSpec,
        reply: Reply<RoomInfo>,
    },
    CreateFromTemplate {
        requester: Option<ConnectionId>,
        category: String,
        name: String,
        capacity: Option<usize>,
        reply: Reply<RoomInfo>,
    },
    Join {
        connection: ConnectionId,
        target: RoomTarget,
        token: Option<String>,
        reply: Reply<RoomInfo>,
    },
    Exit {
        connection: ConnectionId,
        destroy_if_empty: bool,
        reply: Reply<RoomInfo>,
    },
    ChangeWorldSegment {
        target: RoomTarget,
        segment: String,
        keep_players: bool,
        reply: Reply<()>,
    },
    Close {
        room: RoomId,
        reply: Reply<()>,
    },
    Disconnect {
        connection: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    SubmitMatch {
        connections: Vec<ConnectionId>,
        strategy: MatchStrategy,
        criteria: Criteria,
        reply: Reply<MatchId>,
    },
    CancelMatch {
        ticket: MatchId,
        reply: oneshot::Sender<bool>,
    },
    GetRoom {
        target: RoomTarget,
        reply: Reply<RoomInfo>,
    },
    ListRooms {
        predicate: Box<dyn Fn(&RoomInfo) -> bool + Send>,
        reply: oneshot::Sender<Vec<RoomInfo>>,
    },
    QueryRooms {
        query: RoomQuery,
        reply: oneshot::Sender<RoomPage>,
    },
    RoomOfConnection {
        connection: ConnectionId,
        reply: oneshot::Sender<Option<RoomInfo>>,
    },
    Shutdown,
}

/// Unbounded inputs that must never wait for channel capacity.
pub(crate) enum Signal {
    /// Transport-level disconnect, forwarded from the event router.
    Disconnected(ConnectionId),
    /// Retry timer of a parked join fired.
    RetryJoin(u64),
}

// ---------------------------------------------------------------------------
// RoomServerHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable entry point to a running room server.
///
/// Every method fails with [`RoomError::Unavailable`] once the server has
/// shut down.
#[derive(Clone)]
pub struct RoomServerHandle {
    commands: mpsc::Sender<Command>,
    signals: mpsc::UnboundedSender<Signal>,
    events: EventBus<RoomEvent>,
}

impl RoomServerHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| RoomError::Unavailable)?;
        rx.await.map_err(|_| RoomError::Unavailable)
    }

    /// Registers a room and starts loading its world.
    ///
    /// Returns as soon as the load is queued; the room is `Loading` until
    /// [`RoomEvent::CreatedRoom`] is published. Headless rooms come back
    /// `Active`.
    pub async fn create_room(
        &self,
        requester: Option<ConnectionId>,
        spec: RoomSpec,
    ) -> Result<RoomInfo, RoomError> {
        self.call(|reply| Command::Create {
            requester,
            spec,
            reply,
        })
        .await?
    }

    /// Creates a room from a published template.
    pub async fn create_from_template(
        &self,
        requester: Option<ConnectionId>,
        category: impl Into<String>,
        name: impl Into<String>,
        capacity: Option<usize>,
    ) -> Result<RoomInfo, RoomError> {
        let (category, name) = (category.into(), name.into());
        self.call(|reply| Command::CreateFromTemplate {
            requester,
            category,
            name,
            capacity,
            reply,
        })
        .await?
    }

    /// Binds `connection` to a room.
    ///
    /// A join against a room that is still loading resolves once the load
    /// finishes, or with [`RoomError::Timeout`] after the configured number
    /// of retries.
    pub async fn join_room(
        &self,
        connection: ConnectionId,
        target: impl Into<RoomTarget>,
        token: Option<String>,
    ) -> Result<RoomInfo, RoomError> {
        let target = target.into();
        self.call(|reply| Command::Join {
            connection,
            target,
            token,
            reply,
        })
        .await?
    }

    /// Unbinds `connection` and returns the room it left.
    ///
    /// With `destroy_if_empty`, the last connection out of a room that is
    /// destroyed when empty tears it down.
    pub async fn exit_room(
        &self,
        connection: ConnectionId,
        destroy_if_empty: bool,
    ) -> Result<RoomInfo, RoomError> {
        self.call(|reply| Command::Exit {
            connection,
            destroy_if_empty,
            reply,
        })
        .await?
    }

    /// Swaps the room's world for `segment`. Resolves once the swap is
    /// queued, not when it finishes.
    pub async fn change_world_segment(
        &self,
        target: impl Into<RoomTarget>,
        segment: impl Into<String>,
        keep_players: bool,
    ) -> Result<(), RoomError> {
        let (target, segment) = (target.into(), segment.into());
        self.call(|reply| Command::ChangeWorldSegment {
            target,
            segment,
            keep_players,
            reply,
        })
        .await?
    }

    /// Force-closes a room, including one stuck after a failed load.
    pub async fn close_room(&self, room: RoomId) -> Result<(), RoomError> {
        self.call(|reply| Command::Close { room, reply }).await?
    }

    /// Implicit exit for a dropped connection. Resolves once the disconnect
    /// has been processed, which waits for a pending join to be decided.
    /// Unbound connections are a no-op.
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), RoomError> {
        self.call(|reply| Command::Disconnect { connection, reply })
            .await
    }

    /// Fire-and-forget [`disconnect`](Self::disconnect) for synchronous
    /// callers such as router subscriptions.
    pub fn notify_disconnect(&self, connection: ConnectionId) -> Result<(), RoomError> {
        self.signals
            .send(Signal::Disconnected(connection))
            .map_err(|_| RoomError::Unavailable)
    }

    /// Queues `connections` for placement into one room.
    pub async fn submit_match(
        &self,
        connections: Vec<ConnectionId>,
        strategy: MatchStrategy,
        criteria: Criteria,
    ) -> Result<MatchId, RoomError> {
        self.call(|reply| Command::SubmitMatch {
            connections,
            strategy,
            criteria,
            reply,
        })
        .await?
    }

    /// Drops a pending match request. `Ok(false)` if it was already gone.
    pub async fn cancel_match(&self, ticket: MatchId) -> Result<bool, RoomError> {
        self.call(|reply| Command::CancelMatch { ticket, reply }).await
    }

    pub async fn get_room(&self, target: impl Into<RoomTarget>) -> Result<RoomInfo, RoomError> {
        let target = target.into();
        self.call(|reply| Command::GetRoom { target, reply }).await?
    }

    /// Snapshot of every room matching `predicate`, oldest first.
    pub async fn list_rooms<P>(&self, predicate: P) -> Result<Vec<RoomInfo>, RoomError>
    where
        P: Fn(&RoomInfo) -> bool + Send + 'static,
    {
        let predicate = Box::new(predicate);
        self.call(|reply| Command::ListRooms { predicate, reply })
            .await
    }

    pub async fn query_rooms(&self, query: RoomQuery) -> Result<RoomPage, RoomError> {
        self.call(|reply| Command::QueryRooms { query, reply }).await
    }

    pub async fn room_of_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<RoomInfo>, RoomError> {
        self.call(|reply| Command::RoomOfConnection { connection, reply })
            .await
    }

    /// Subscribes to room events published from now on.
    pub fn subscribe(&self) -> EventStream<RoomEvent> {
        self.events.subscribe()
    }

    /// Stops the server. Pending joins are dropped and their callers see
    /// [`RoomError::Unavailable`].
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| RoomError::Unavailable)
    }

    /// Returns `true` once the server task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

// ---------------------------------------------------------------------------
// RoomServerBuilder
// ---------------------------------------------------------------------------

/// Configures and spawns a room server.
///
/// ```no_run
/// # async fn demo() -> Result<(), realm_room::RoomError> {
/// use realm_room::{RoomServerBuilder, RoomSpec};
/// use realm_scene::SimulatedBackend;
///
/// let rooms = RoomServerBuilder::new(SimulatedBackend::new()).spawn();
/// let info = rooms.create_room(None, RoomSpec::new("Arena", "Map1", 10)).await?;
/// println!("{} is {}", info.name, info.state);
/// # Ok(())
/// # }
/// ```
pub struct RoomServerBuilder<B: WorldBackend> {
    backend: B,
    config: RoomServerConfig,
    room_validators: Vec<Box<dyn RoomValidator>>,
    access_validators: Vec<Box<dyn RoomAccessValidator>>,
    templates: Vec<RoomTemplate>,
    default_validators: bool,
}

impl<B: WorldBackend> RoomServerBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: RoomServerConfig::default(),
            room_validators: Vec::new(),
            access_validators: Vec::new(),
            templates: Vec::new(),
            default_validators: true,
        }
    }

    pub fn config(mut self, config: RoomServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a creation policy. Runs after the built-in ones.
    pub fn room_validator(mut self, validator: impl RoomValidator) -> Self {
        self.room_validators.push(Box::new(validator));
        self
    }

    /// Adds a join policy. Runs after the built-in ones.
    pub fn access_validator(mut self, validator: impl RoomAccessValidator) -> Self {
        self.access_validators.push(Box::new(validator));
        self
    }

    /// Publishes a template for [`RoomServerHandle::create_from_template`].
    pub fn template(mut self, template: RoomTemplate) -> Self {
        self.templates.push(template);
        self
    }

    /// Drops [`CapacityValidator`] and [`PasswordValidator`].
    pub fn without_default_validators(mut self) -> Self {
        self.default_validators = false;
        self
    }

    /// Spawns the server task on the current Tokio runtime.
    pub fn spawn(self) -> RoomServerHandle {
        let config = self.config.validated();
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let mut room_validators: Vec<Box<dyn RoomValidator>> = Vec::new();
        let mut access_validators: Vec<Box<dyn RoomAccessValidator>> = Vec::new();
        if self.default_validators {
            room_validators.push(Box::new(CapacityValidator::default()));
            access_validators.push(Box::new(PasswordValidator));
        }
        room_validators.extend(self.room_validators);
        access_validators.extend(self.access_validators);

        let mut templates = TemplateCatalog::new();
        templates.publish(config.matchmaking.room_template.clone());
        for template in self.templates {
            templates.publish(template);
        }

        let (scenes, completions) = SceneOrchestrator::new(self.backend);
        let server = RoomServer {
            registry: RoomRegistry::new(config.id_seed),
            scenes,
            matchmaking: MatchmakingEngine::new(config.matchmaking.clone()),
            templates,
            room_validators,
            access_validators,
            events: events.clone(),
            signals: signal_tx.clone(),
            parked: Vec::new(),
            deferred: HashMap::new(),
            next_join: 1,
            config,
        };
        tokio::spawn(run(server, command_rx, signal_rx, completions));

        RoomServerHandle {
            commands: command_tx,
            signals: signal_tx,
            events,
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run<B: WorldBackend>(
    mut server: RoomServer<B>,
    mut commands: mpsc::Receiver<Command>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut completions: SceneCompletions,
) {
    let mut ticker = tokio::time::interval(server.config.matchmaking.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!("room server started");

    loop {
        tokio::select! {
            biased;

            Some(completion) = completions.recv() => server.on_scene_completion(completion),
            Some(signal) = signals.recv() => match signal {
                Signal::Disconnected(connection) => server.disconnect(connection, None),
                Signal::RetryJoin(join) => server.retry_join(join),
            },
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => server.handle(command),
            },
            _ = ticker.tick() => server.run_matchmaking(),
        }
    }

    tracing::info!(
        rooms = server.registry.len(),
        parked = server.parked.len(),
        "room server stopped"
    );
}

impl<B: WorldBackend> RoomServer<B> {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Create {
                requester,
                spec,
                reply,
            } => {
                let _ = reply.send(self.create_room(requester, spec));
            }
            Command::CreateFromTemplate {
                requester,
                category,
                name,
                capacity,
                reply,
            } => {
                let _ = reply.send(self.create_from_template(requester, &category, name, capacity));
            }
            Command::Join {
                connection,
                target,
                token,
                reply,
            } => self.join_room(connection, &target, token.as_deref(), JoinReply::Client(reply)),
            Command::Exit {
                connection,
                destroy_if_empty,
                reply,
            } => {
                let _ = reply.send(self.exit_room(connection, destroy_if_empty, ExitCause::Requested));
            }
            Command::ChangeWorldSegment {
                target,
                segment,
                keep_players,
                reply,
            } => {
                let _ = reply.send(self.change_world_segment(&target, segment, keep_players));
            }
            Command::Close { room, reply } => {
                let _ = reply.send(self.close_room(room));
            }
            Command::Disconnect { connection, reply } => self.disconnect(connection, Some(reply)),
            Command::SubmitMatch {
                connections,
                strategy,
                criteria,
                reply,
            } => {
                let _ = reply.send(self.submit_match(connections, strategy, criteria));
            }
            Command::CancelMatch { ticket, reply } => {
                let _ = reply.send(self.cancel_match(ticket));
            }
            Command::GetRoom { target, reply } => {
                let _ = reply.send(self.get_room(&target));
            }
            Command::ListRooms { predicate, reply } => {
                let _ = reply.send(self.list_rooms(&*predicate));
            }
            Command::QueryRooms { query, reply } => {
                let _ = reply.send(self.query_rooms(&query));
            }
            Command::RoomOfConnection { connection, reply } => {
                let _ = reply.send(self.room_of_connection(connection));
            }
            Command::Shutdown => {}
        }
    }
}
