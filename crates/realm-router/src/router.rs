//! Translation of transport signals into typed server callbacks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use realm_transport::{ConnectionId, TransportEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{HandlerError, RouterError};

// ---------------------------------------------------------------------------
// ServerEvent
// ---------------------------------------------------------------------------

/// A router-level event, one per transport signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    Start,
    Stop,
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    Ready(ConnectionId),
}

impl From<&TransportEvent> for ServerEvent {
    fn from(event: &TransportEvent) -> Self {
        match event {
            TransportEvent::Listening { .. } => Self::Start,
            TransportEvent::ShutDown => Self::Stop,
            TransportEvent::Accepted { connection, .. } => Self::Connect(*connection),
            TransportEvent::Ready { connection } => Self::Ready(*connection),
            TransportEvent::Closed { connection, .. } => Self::Disconnect(*connection),
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "OnServerStart"),
            Self::Stop => write!(f, "OnServerStop"),
            Self::Connect(id) => write!(f, "OnServerConnect({id})"),
            Self::Disconnect(id) => write!(f, "OnServerDisconnect({id})"),
            Self::Ready(id) => write!(f, "OnServerReady({id})"),
        }
    }
}

/// Handle returned by every `on_server_*` call; pass it to
/// [`ConnectionEventRouter::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type LifecycleFn = Box<dyn Fn() -> Result<(), HandlerError> + Send + Sync>;
type ConnectionFn = Box<dyn Fn(ConnectionId) -> Result<(), HandlerError> + Send + Sync>;

enum Handler {
    Start(LifecycleFn),
    Stop(LifecycleFn),
    Connect(ConnectionFn),
    Disconnect(ConnectionFn),
    Ready(ConnectionFn),
}

impl Handler {
    /// Runs the handler if it listens for `event`.
    fn invoke(&self, event: ServerEvent) -> Option<Result<(), HandlerError>> {
        match (self, event) {
            (Self::Start(f), ServerEvent::Start) | (Self::Stop(f), ServerEvent::Stop) => Some(f()),
            (Self::Connect(f), ServerEvent::Connect(id))
            | (Self::Disconnect(f), ServerEvent::Disconnect(id))
            | (Self::Ready(f), ServerEvent::Ready(id)) => Some(f(id)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionEventRouter
// ---------------------------------------------------------------------------

/// Re-exposes transport signals as named server events.
///
/// Each routed [`TransportEvent`] reaches every matching subscriber exactly
/// once, in subscription order, and events are routed in the order they are
/// received. A failing subscriber does not stop delivery to the others; the
/// failures are returned from [`route`](Self::route) instead.
///
/// Handlers run on the routing task and must not block. Subscribing from
/// inside a handler is allowed and takes effect from the next event.
#[derive(Default)]
pub struct ConnectionEventRouter {
    subscribers: RwLock<Vec<(SubscriptionId, Arc<Handler>)>>,
    next_id: AtomicU64,
}

impl ConnectionEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_server_start<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Handler::Start(Box::new(handler)))
    }

    pub fn on_server_stop<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Handler::Stop(Box::new(handler)))
    }

    pub fn on_server_connect<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ConnectionId) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Handler::Connect(Box::new(handler)))
    }

    pub fn on_server_disconnect<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ConnectionId) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Handler::Disconnect(Box::new(handler)))
    }

    pub fn on_server_ready<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ConnectionId) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(Handler::Ready(Box::new(handler)))
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Translates one transport signal and delivers it to all subscribers.
    ///
    /// # Errors
    /// Returns [`RouterError::HandlerFailed`] if any subscriber failed. All
    /// subscribers have seen the event by then.
    pub fn route(&self, event: &TransportEvent) -> Result<ServerEvent, RouterError> {
        let server_event = ServerEvent::from(event);

        // Snapshot so handlers run without the lock held.
        let handlers: Vec<Arc<Handler>> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let failures: Vec<HandlerError> = handlers
            .iter()
            .filter_map(|handler| handler.invoke(server_event))
            .filter_map(Result::err)
            .collect();

        tracing::trace!(event = %server_event, "routed transport event");

        if failures.is_empty() {
            Ok(server_event)
        } else {
            Err(RouterError::HandlerFailed {
                event: server_event,
                failures,
            })
        }
    }

    /// Pumps transport signals from `events` until the channel closes.
    ///
    /// The returned task resolves with the first routing failure, which
    /// stops the pump: the owner is expected to treat it as fatal.
    pub fn attach(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<Result<(), RouterError>> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.route(&event) {
                    tracing::error!(error = %e, "router subscriber failed");
                    return Err(e);
                }
            }
            tracing::debug!("transport event stream closed");
            Ok(())
        })
    }

    fn subscribe(&self, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }
}
