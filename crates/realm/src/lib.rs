//! # Realm
//!
//! Multi-tenant room server for multiplayer game backends.
//!
//! One process hosts many isolated rooms. Each room owns a world segment
//! loaded through a [`WorldBackend`], a set of bound connections, and a
//! lifecycle driven by a single room server task. This crate is the
//! network front door: it accepts WebSocket connections, turns wire
//! requests into room server calls, and pushes room deltas back out.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use realm::prelude::*;
//!
//! # async fn demo() -> Result<(), RealmError> {
//! realm::init_tracing();
//! let server = RealmServerBuilder::new(SimulatedBackend::new())
//!     .bind("0.0.0.0:8080")
//!     .build()
//!     .await?;
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
mod lobby;
mod server;

pub use error::RealmError;
pub use server::{FrontDoorConfig, RealmServer, RealmServerBuilder};

/// Everything a host needs to stand up a server.
pub mod prelude {
    pub use crate::{FrontDoorConfig, RealmError, RealmServer, RealmServerBuilder};
    pub use realm_protocol::{
        ClientMessage, Codec, Envelope, ErrorCode, JsonCodec, MatchId, RoomDelta, RoomId,
        RoomQuery, RoomState, RoomTarget, ServerMessage,
    };
    pub use realm_room::{
        MatchStrategy, RoomError, RoomEvent, RoomInfo, RoomServerConfig, RoomServerHandle,
        RoomSpec, RoomTemplate,
    };
    pub use realm_router::{ConnectionEventRouter, HandlerError, ServerEvent};
    pub use realm_scene::{LoadStrategy, SimulatedBackend, WorldBackend};
    pub use realm_transport::ConnectionId;
}

pub use realm_scene::WorldBackend;

/// Installs a `tracing` subscriber that logs to stderr.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Calling this
/// more than once is harmless; only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if installed.is_ok() {
        tracing::debug!("tracing initialised");
    }
}
