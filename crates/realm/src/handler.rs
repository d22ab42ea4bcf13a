//! Per-connection handler: decode requests, call the room server, queue
//! answers.
//!
//! Each accepted connection gets a reader task (this handler) and a
//! writer task draining its outbound queue. The flow is:
//!   1. Register the outbound queue and emit `Accepted`
//!   2. Loop: receive envelope → dispatch → queue the answer
//!   3. On exit the guard unregisters and emits `Closed`, which reaches
//!      the room server through the router as a disconnect

use std::sync::Arc;
use std::time::Instant;

use realm_protocol::{ClientMessage, Codec, Envelope, ErrorCode, JsonCodec, ServerMessage};
use realm_room::{MatchStrategy, RoomError, RoomSpec};
use realm_transport::{Connection, ConnectionId, TransportEvent, WebSocketConnection};
use tokio::sync::mpsc;

use crate::RealmError;
use crate::server::ServerState;

/// Unregisters the connection and reports it closed when the handler
/// exits, including by panic.
struct ConnectionGuard {
    connection: ConnectionId,
    reason: Option<String>,
    state: Arc<ServerState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.connections.remove(self.connection);
        self.state.emit(TransportEvent::Closed {
            connection: self.connection,
            reason: self.reason.take(),
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection(
    conn: WebSocketConnection,
    state: Arc<ServerState>,
) -> Result<(), RealmError> {
    let connection = conn.id();
    let start = Instant::now();
    tracing::debug!(%connection, "handling new connection");

    let (outbound, queue) = mpsc::unbounded_channel();
    state.connections.register(connection, outbound.clone());
    state.emit(TransportEvent::Accepted {
        connection,
        peer: conn.peer_addr(),
    });
    let mut guard = ConnectionGuard {
        connection,
        reason: None,
        state: Arc::clone(&state),
    };

    let conn = Arc::new(conn);
    let writer = tokio::spawn(write_loop(Arc::clone(&conn), queue, state.codec, start));

    loop {
        let data = match tokio::time::timeout(state.idle_timeout, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!(%connection, "connection closed cleanly");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(%connection, error = %e, "recv error");
                guard.reason = Some(e.to_string());
                break;
            }
            Err(_) => {
                tracing::info!(%connection, "connection idle, dropping");
                guard.reason = Some("idle timeout".into());
                break;
            }
        };

        let envelope: Envelope<ClientMessage> = match state.codec.decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%connection, error = %e, "failed to decode envelope");
                let _ = outbound.send(ServerMessage::error(
                    ErrorCode::InvalidRequest,
                    format!("undecodable message: {e}"),
                ));
                continue;
            }
        };

        if let Some(reply) = dispatch(&state, connection, envelope.payload).await {
            if outbound.send(reply).is_err() {
                break;
            }
        }
    }

    drop(outbound);
    drop(guard);
    // The writer stops once the last queue sender is gone.
    match writer.await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(%connection, error = %e, "writer task failed");
            Ok(())
        }
    }
}

/// Drains the outbound queue onto the socket.
async fn write_loop(
    conn: Arc<WebSocketConnection>,
    mut queue: mpsc::UnboundedReceiver<ServerMessage>,
    codec: JsonCodec,
    start: Instant,
) -> Result<(), RealmError> {
    let mut seq: u64 = 1;
    while let Some(message) = queue.recv().await {
        let envelope = Envelope::new(next_seq(&mut seq), millis_since(start), message);
        let bytes = codec.encode(&envelope)?;
        if let Err(e) = conn.send(&bytes).await {
            tracing::debug!(connection = %conn.id(), error = %e, "send failed, writer stopping");
            return Err(e.into());
        }
    }
    if let Err(e) = conn.close().await {
        tracing::trace!(connection = %conn.id(), error = %e, "close after writer drain");
    }
    Ok(())
}

/// Runs one request against the room server. `None` means nothing to
/// answer.
async fn dispatch(
    state: &ServerState,
    connection: ConnectionId,
    message: ClientMessage,
) -> Option<ServerMessage> {
    let rooms = &state.rooms;
    let result = match message {
        ClientMessage::Ready => {
            if state.connections.mark_ready(connection) {
                state.emit(TransportEvent::Ready { connection });
            }
            return None;
        }

        ClientMessage::CreateRoom {
            name,
            template: Some(category),
            max_players,
            ..
        } => rooms
            .create_from_template(Some(connection), category, name, max_players)
            .await
            .map(|info| ServerMessage::RoomCreated {
                room: info.to_summary(),
            }),

        ClientMessage::CreateRoom {
            name,
            template: None,
            segment,
            max_players,
            private,
            password,
            custom_data,
        } => {
            let max_players = max_players.unwrap_or(state.default_max_players);
            let mut spec = match segment {
                Some(segment) => RoomSpec::new(name, segment, max_players),
                None => RoomSpec::headless(name, max_players),
            };
            spec.private = private;
            if let Some(password) = password {
                spec = spec.private_with_token(password);
            }
            spec.custom_data = custom_data;
            rooms
                .create_room(Some(connection), spec)
                .await
                .map(|info| ServerMessage::RoomCreated {
                    room: info.to_summary(),
                })
        }

        ClientMessage::JoinRoom { target, token } => rooms
            .join_room(connection, target, token)
            .await
            .map(|info| ServerMessage::RoomJoined {
                room: info.to_summary(),
            }),

        ClientMessage::ExitRoom => rooms
            .exit_room(connection, true)
            .await
            .map(|info| ServerMessage::RoomExited {
                room_id: info.room_id,
            }),

        ClientMessage::QueryRooms { query } => rooms
            .query_rooms(query)
            .await
            .map(|page| ServerMessage::RoomList { page }),

        ClientMessage::FindMatch { criteria } => {
            let strategy = if criteria.is_empty() {
                MatchStrategy::Any
            } else {
                MatchStrategy::Attributes
            };
            // The placement pass can broadcast before the ticket comes back.
            state.connections.begin_submit(connection);
            match rooms.submit_match(vec![connection], strategy, criteria).await {
                Ok(ticket) => {
                    let reply = ServerMessage::MatchQueued { ticket };
                    state.connections.claim_ticket(connection, ticket, reply);
                    return None;
                }
                Err(e) => {
                    state.connections.abandon_submit(connection);
                    Err(e)
                }
            }
        }

        ClientMessage::CancelMatch { ticket } => {
            // Only the submitting connection may cancel its ticket.
            let cancelled = if state.connections.release_ticket(connection, ticket) {
                rooms.cancel_match(ticket).await
            } else {
                Ok(false)
            };
            cancelled.map(|cancelled| ServerMessage::MatchCancelled { ticket, cancelled })
        }
    };

    Some(result.unwrap_or_else(|e| error_reply(connection, &e)))
}

fn error_reply(connection: ConnectionId, err: &RoomError) -> ServerMessage {
    tracing::debug!(%connection, error = %err, "request rejected");
    ServerMessage::error(err.code(), err.to_string())
}

fn millis_since(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Increments and returns the next sequence number.
fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}
