//! Room orchestration for Realm.
//!
//! A single server task owns every room, binds connections to them, drives
//! world segment loads through the scene queue, and places match requests.
//! Callers talk to it through a cloneable [`RoomServerHandle`].
//!
//! # Key types
//!
//! - [`RoomServerBuilder`] — configures validators and templates, spawns
//!   the server
//! - [`RoomServerHandle`] — create, join, exit, change world, matchmaking
//! - [`RoomRegistry`] — the authoritative table of rooms and bindings
//! - [`Room`] / [`RoomInfo`] — the entity and its snapshot
//! - [`RoomEvent`] — what collaborators can subscribe to
//! - [`MatchmakingEngine`] — first-fit placement of match requests
//!
//! # Lifecycle
//!
//! ```text
//! Created → Loading → Active → Closing → Destroyed
//!              ▲         │
//!              └─────────┘  world segment change
//! ```
//!
//! Connections only bind to `Active` rooms. Joins against a room that is
//! still loading wait for the load, up to a retry budget.

mod config;
mod error;
mod event;
mod matchmaking;
mod query;
mod registry;
mod room;
mod server;
mod template;
mod validate;
mod workflow;

pub use config::{MatchmakingConfig, RoomServerConfig};
pub use error::RoomError;
pub use event::RoomEvent;
pub use matchmaking::{Criteria, MatchRequest, MatchStrategy, MatchmakingEngine, RoomMatcher};
pub use query::{matches_filter, run_query};
pub use registry::{RoomIdGenerator, RoomRegistry};
pub use room::{Room, RoomInfo};
pub use server::{RoomServerBuilder, RoomServerHandle};
pub use template::{RoomSpec, RoomTemplate, TemplateCatalog};
pub use validate::{CapacityValidator, PasswordValidator, RoomAccessValidator, RoomValidator};
