//! `RealmServer` builder and accept loop.
//!
//! This is the network front door. It ties the layers together:
//! transport → router → room server, with one handler task per
//! connection and a broadcaster pushing room deltas back out.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use realm_protocol::JsonCodec;
use realm_room::{
    RoomAccessValidator, RoomServerBuilder, RoomServerConfig, RoomServerHandle, RoomTemplate,
    RoomValidator,
};
use realm_router::{ConnectionEventRouter, HandlerError};
use realm_scene::WorldBackend;
use realm_transport::{Transport, TransportEvent, WebSocketTransport};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::RealmError;
use crate::handler::handle_connection;
use crate::lobby::{ConnectionTable, spawn_broadcaster};

// ---------------------------------------------------------------------------
// FrontDoorConfig
// ---------------------------------------------------------------------------

/// Settings for the network side of the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontDoorConfig {
    pub bind_addr: String,

    /// A connection that sends nothing for this long is dropped.
    pub idle_timeout: Duration,

    /// Capacity for rooms created over the wire without one.
    pub default_max_players: usize,
}

impl Default for FrontDoorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            idle_timeout: Duration::from_secs(30),
            default_max_players: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerState
// ---------------------------------------------------------------------------

/// Shared state handed to every connection task.
pub(crate) struct ServerState {
    pub(crate) rooms: RoomServerHandle,
    pub(crate) connections: Arc<ConnectionTable>,
    pub(crate) codec: JsonCodec,
    pub(crate) idle_timeout: Duration,
    pub(crate) default_max_players: usize,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerState {
    /// Feeds a transport signal to the router pump.
    pub(crate) fn emit(&self, event: TransportEvent) {
        if self.transport_events.send(event).is_err() {
            tracing::debug!("router pump gone, transport signal dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// RealmServerBuilder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a Realm server.
///
/// # Example
///
/// ```rust,no_run
/// use realm::prelude::*;
///
/// # async fn demo() -> Result<(), RealmError> {
/// let server = RealmServerBuilder::new(SimulatedBackend::new())
///     .bind("0.0.0.0:8080")
///     .template(RoomTemplate::new("duel", "Arena", 2, 2))
///     .build()
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct RealmServerBuilder<B: WorldBackend> {
    front_door: FrontDoorConfig,
    rooms: RoomServerBuilder<B>,
}

impl<B: WorldBackend> RealmServerBuilder<B> {
    /// Creates a builder whose rooms load worlds through `backend`.
    pub fn new(backend: B) -> Self {
        Self {
            front_door: FrontDoorConfig::default(),
            rooms: RoomServerBuilder::new(backend),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.front_door.bind_addr = addr.to_string();
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.front_door.idle_timeout = timeout;
        self
    }

    pub fn front_door(mut self, config: FrontDoorConfig) -> Self {
        self.front_door = config;
        self
    }

    pub fn room_config(mut self, config: RoomServerConfig) -> Self {
        self.rooms = self.rooms.config(config);
        self
    }

    /// Publishes a template clients can create rooms from.
    pub fn template(mut self, template: RoomTemplate) -> Self {
        self.rooms = self.rooms.template(template);
        self
    }

    pub fn room_validator(mut self, validator: impl RoomValidator) -> Self {
        self.rooms = self.rooms.room_validator(validator);
        self
    }

    pub fn access_validator(mut self, validator: impl RoomAccessValidator) -> Self {
        self.rooms = self.rooms.access_validator(validator);
        self
    }

    /// Binds the listener and starts the room server.
    ///
    /// The room server subscribes to the router's disconnect event here, so
    /// a dropped connection always leaves its room.
    pub async fn build(self) -> Result<RealmServer, RealmError> {
        let transport = WebSocketTransport::bind(&self.front_door.bind_addr).await?;
        let rooms = self.rooms.spawn();

        let router = Arc::new(ConnectionEventRouter::new());
        let on_disconnect = rooms.clone();
        router.on_server_disconnect(move |connection| {
            on_disconnect
                .notify_disconnect(connection)
                .map_err(|e| HandlerError::new(e.to_string()))
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ServerState {
            rooms,
            connections: Arc::new(ConnectionTable::default()),
            codec: JsonCodec,
            idle_timeout: self.front_door.idle_timeout,
            default_max_players: self.front_door.default_max_players.max(1),
            transport_events: tx,
        });

        Ok(RealmServer {
            transport,
            router,
            transport_rx: rx,
            state,
        })
    }
}

// ---------------------------------------------------------------------------
// RealmServer
// ---------------------------------------------------------------------------

/// A bound Realm server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct RealmServer {
    transport: WebSocketTransport,
    router: Arc<ConnectionEventRouter>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    state: Arc<ServerState>,
}

impl RealmServer {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RealmError> {
        Ok(self.transport.local_addr()?)
    }

    /// Handle to the room server, for host-side room management.
    pub fn rooms(&self) -> &RoomServerHandle {
        &self.state.rooms
    }

    /// The router fed by this server's transport signals. Subscribe before
    /// calling [`run()`](Self::run) to see every event.
    pub fn router(&self) -> &Arc<ConnectionEventRouter> {
        &self.router
    }

    /// Runs the accept loop until a router subscriber fails.
    pub async fn run(self) -> Result<(), RealmError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` resolves or a router
    /// subscriber fails.
    ///
    /// # Errors
    /// Returns [`RealmError::Router`] when a subscriber fails. The failure
    /// is fatal: the pump stops routing and the server stops accepting.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), RealmError> {
        let mut pump = Arc::clone(&self.router).attach(self.transport_rx);
        let broadcaster = spawn_broadcaster(&self.state.rooms, Arc::clone(&self.state.connections));
        let addr = self.transport.local_addr().ok();
        self.state.emit(TransportEvent::Listening { addr });
        tracing::info!(?addr, "realm server running");

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                routed = &mut pump => {
                    break match routed {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(RealmError::Router(e)),
                        Err(e) => Err(RealmError::RouterTask(e)),
                    };
                }
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        };

        pump.abort();
        match &result {
            Ok(()) => {
                if let Err(e) = self.router.route(&TransportEvent::ShutDown) {
                    tracing::warn!(error = %e, "stop subscriber failed");
                }
            }
            Err(e) => tracing::error!(error = %e, "realm server stopping"),
        }
        if let Err(e) = self.transport.shutdown().await {
            tracing::warn!(error = %e, "transport shutdown failed");
        }
        if self.state.rooms.shutdown().await.is_err() {
            tracing::debug!("room server already stopped");
        }
        broadcaster.abort();
        result
    }
}
