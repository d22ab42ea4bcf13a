//! Event plumbing for Realm.
//!
//! Two pieces live here:
//!
//! - [`ConnectionEventRouter`] — turns raw [`TransportEvent`]s into typed,
//!   multiply-subscribable server callbacks (`on_server_connect`,
//!   `on_server_disconnect`, ...).
//! - [`EventBus`] — ordered, lossless fan-out of domain events (room
//!   events) to any number of channel subscribers.
//!
//! Subscriber failures propagate: the router delivers an event to every
//! subscriber, then reports all failures to whoever is pumping it.
//! Nothing is de-listed.
//!
//! [`TransportEvent`]: realm_transport::TransportEvent

mod bus;
mod error;
mod router;

pub use bus::{EventBus, EventStream};
pub use error::{HandlerError, RouterError};
pub use router::{ConnectionEventRouter, ServerEvent, SubscriptionId};
