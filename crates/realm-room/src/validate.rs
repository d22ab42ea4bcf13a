//! Pluggable policy for room creation and joins.
//!
//! Validators run before any state changes. A rejection carries a
//! human-readable reason and surfaces to the caller as
//! [`RoomError::AccessDenied`](crate::RoomError::AccessDenied).

use realm_transport::ConnectionId;

use crate::{Room, RoomRegistry, RoomSpec};

/// Gates room creation.
///
/// Closures with the same signature implement this trait, so ad-hoc rules
/// need no named type:
///
/// ```
/// # use realm_room::{RoomRegistry, RoomSpec};
/// # use realm_transport::ConnectionId;
/// let no_lobbies = |_: Option<ConnectionId>, spec: &RoomSpec, _: &RoomRegistry| {
///     if spec.name.starts_with("lobby") {
///         Err("lobby names are reserved".to_owned())
///     } else {
///         Ok(())
///     }
/// };
/// # let _ = no_lobbies;
/// ```
pub trait RoomValidator: Send + Sync + 'static {
    /// `requester` is `None` for rooms the server creates on its own
    /// (matchmaking, templates requested by game code).
    fn validate_create(
        &self,
        requester: Option<ConnectionId>,
        spec: &RoomSpec,
        registry: &RoomRegistry,
    ) -> Result<(), String>;
}

impl<F> RoomValidator for F
where
    F: Fn(Option<ConnectionId>, &RoomSpec, &RoomRegistry) -> Result<(), String> + Send + Sync + 'static,
{
    fn validate_create(
        &self,
        requester: Option<ConnectionId>,
        spec: &RoomSpec,
        registry: &RoomRegistry,
    ) -> Result<(), String> {
        self(requester, spec, registry)
    }
}

/// Gates joins into an existing room.
pub trait RoomAccessValidator: Send + Sync + 'static {
    fn validate_join(
        &self,
        room: &Room,
        connection: ConnectionId,
        token: Option<&str>,
    ) -> Result<(), String>;
}

impl<F> RoomAccessValidator for F
where
    F: Fn(&Room, ConnectionId, Option<&str>) -> Result<(), String> + Send + Sync + 'static,
{
    fn validate_join(
        &self,
        room: &Room,
        connection: ConnectionId,
        token: Option<&str>,
    ) -> Result<(), String> {
        self(room, connection, token)
    }
}

// ---------------------------------------------------------------------------
// Built-in validators
// ---------------------------------------------------------------------------

/// Caps the number of live rooms and the size of any one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityValidator {
    pub max_rooms: Option<usize>,
    pub max_players_limit: usize,
}

impl Default for CapacityValidator {
    fn default() -> Self {
        Self {
            max_rooms: None,
            max_players_limit: 256,
        }
    }
}

impl RoomValidator for CapacityValidator {
    fn validate_create(
        &self,
        _requester: Option<ConnectionId>,
        spec: &RoomSpec,
        registry: &RoomRegistry,
    ) -> Result<(), String> {
        if spec.max_players > self.max_players_limit {
            return Err(format!(
                "max_players {} exceeds the limit of {}",
                spec.max_players, self.max_players_limit
            ));
        }
        match self.max_rooms {
            Some(max_rooms) if registry.len() >= max_rooms => {
                Err(format!("server already hosts {max_rooms} rooms"))
            }
            _ => Ok(()),
        }
    }
}

/// Requires the room's access token, when it has one.
///
/// A private room admits only callers presenting its token. A private
/// room created without a token admits nobody through a join; it can
/// still be filled by the server itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PasswordValidator;

impl RoomAccessValidator for PasswordValidator {
    fn validate_join(
        &self,
        room: &Room,
        _connection: ConnectionId,
        token: Option<&str>,
    ) -> Result<(), String> {
        match (room.access_token(), room.is_private()) {
            (Some(expected), _) if token == Some(expected) => Ok(()),
            (_, true) => Err(format!("room {} is private", room.name())),
            (None, false) => Ok(()),
            (Some(_), false) => Err(format!("wrong password for room {}", room.name())),
        }
    }
}
