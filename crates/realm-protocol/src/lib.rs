//! Wire protocol for Realm.
//!
//! This crate holds everything both sides of the wire agree on:
//!
//! - **Identifiers** ([`RoomId`], [`MatchId`], [`RoomTarget`]) and the
//!   room lifecycle enum [`RoomState`].
//! - **Messages** ([`ClientMessage`], [`ServerMessage`]) — flat,
//!   versionless request/response records carried in an [`Envelope`].
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how envelopes become
//!   bytes.
//!
//! Messages carry no version field. Adding a field is a coordinated
//! client/server redeploy; optional fields use `#[serde(default)]` so an
//! older peer that omits them still decodes.

mod codec;
mod error;
mod messages;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use messages::{
    ClientMessage, Envelope, ErrorCode, RoomDelta, RoomFilter, RoomPage,
    RoomQuery, RoomSummary, ServerMessage, SortKey, DEFAULT_PAGE_SIZE,
};
pub use types::{MatchId, RoomId, RoomState, RoomTarget};
