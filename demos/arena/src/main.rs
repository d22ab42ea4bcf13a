use std::time::Duration;

use realm::prelude::*;

// ---------------------------------------------------------------------------
// Server setup
// ---------------------------------------------------------------------------

/// Simulated world load time, so clients can watch rooms go through
/// `Loading` before they turn `Active`.
const LOAD_LATENCY: Duration = Duration::from_millis(250);

async fn build_server(addr: &str, latency: Duration) -> Result<RealmServer, RealmError> {
    let mut config = RoomServerConfig::default();
    config.matchmaking.room_template = RoomTemplate::new("match", "Colosseum", 2, 4);
    config.matchmaking.tick_interval = Duration::from_millis(500);

    let server = RealmServerBuilder::new(SimulatedBackend::with_latency(latency))
        .bind(addr)
        .room_config(config)
        .template(RoomTemplate::new("duel", "Pit", 2, 2))
        .template(RoomTemplate::new("skirmish", "Ruins", 2, 8))
        .build()
        .await?;

    // One room that always exists for players to idle in.
    let lobby = RoomSpec::headless("Lobby", 256).persistent();
    server.rooms().create_room(None, lobby).await?;

    server.router().on_server_ready(|connection| {
        tracing::info!(%connection, "player entered the lobby");
        Ok(())
    });

    Ok(server)
}

/// Logs what happens to rooms, the way a spawner or chat service would
/// follow along.
fn watch_rooms(rooms: &RoomServerHandle) {
    let mut events = rooms.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::CreatedRoom(info) => {
                    tracing::info!(room_id = %info.room_id, name = %info.name, "room ready");
                }
                RoomEvent::MatchPlaced {
                    ticket,
                    room,
                    connections,
                } => {
                    tracing::info!(%ticket, room_id = %room, players = connections.len(), "match placed");
                }
                RoomEvent::SceneFailed { room, reason } => {
                    tracing::warn!(room_id = %room, %reason, "world failed to load");
                }
                _ => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    realm::init_tracing();
    let addr = std::env::var("REALM_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let server = build_server(&addr, LOAD_LATENCY).await?;
    watch_rooms(server.rooms());
    tracing::info!(%addr, "arena server starting");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
