//! End-to-end tests of the room server workflows against a hand-driven
//! world backend.

use std::time::Duration;

use realm_protocol::{RoomQuery, RoomState, RoomTarget};
use realm_room::{
    Criteria, MatchStrategy, RoomError, RoomEvent, RoomInfo, RoomRegistry, RoomServerBuilder,
    RoomServerConfig, RoomServerHandle, RoomSpec, RoomTemplate,
};
use realm_router::EventStream;
use realm_scene::LoadStrategy;
use realm_scene::testing::{BackendCall, ManualBackend};
use realm_transport::ConnectionId;
use tokio::time::{Instant, timeout};

// =========================================================================
// Helpers
// =========================================================================

fn conn(id: u64) -> ConnectionId {
    ConnectionId::new(id)
}

fn config() -> RoomServerConfig {
    RoomServerConfig {
        join_retry_interval: Duration::from_secs(30),
        id_seed: Some(42),
        ..Default::default()
    }
}

fn setup() -> (RoomServerHandle, ManualBackend, EventStream<RoomEvent>) {
    let backend = ManualBackend::new();
    let rooms = RoomServerBuilder::new(backend.clone())
        .config(config())
        .template(RoomTemplate::new("duel", "Pit", 2, 2))
        .spawn();
    let events = rooms.subscribe();
    (rooms, backend, events)
}

/// Waits for the first event matching `pred`, skipping others.
async fn expect_event(
    events: &mut EventStream<RoomEvent>,
    pred: impl Fn(&RoomEvent) -> bool,
) -> RoomEvent {
    timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Creates a room and lets its world load.
async fn active_room(
    rooms: &RoomServerHandle,
    backend: &ManualBackend,
    events: &mut EventStream<RoomEvent>,
    spec: RoomSpec,
) -> RoomInfo {
    let info = rooms.create_room(None, spec).await.unwrap();
    backend.complete_when_ready().await;
    let id = info.room_id;
    match expect_event(events, |e| matches!(e, RoomEvent::CreatedRoom(i) if i.room_id == id)).await {
        RoomEvent::CreatedRoom(info) => info,
        _ => unreachable!(),
    }
}

/// Spawns a join so the test can keep driving the backend while it waits.
fn spawn_join(
    rooms: &RoomServerHandle,
    connection: ConnectionId,
    target: &str,
) -> tokio::task::JoinHandle<Result<RoomInfo, RoomError>> {
    let rooms = rooms.clone();
    let target = target.to_owned();
    tokio::spawn(async move { rooms.join_room(connection, target, None).await })
}

/// Room validator that rejects everything, so match requests stay queued.
fn refuse_all(_: Option<ConnectionId>, _: &RoomSpec, _: &RoomRegistry) -> Result<(), String> {
    Err("maintenance".to_owned())
}

/// Lets spawned callers send their commands, then round-trips one query so
/// the server has processed them.
async fn settle(rooms: &RoomServerHandle) {
    tokio::task::yield_now().await;
    rooms.query_rooms(RoomQuery::default()).await.unwrap();
}

// =========================================================================
// Create
// =========================================================================

#[tokio::test]
async fn test_scenario_a_join_waits_for_load_then_succeeds() {
    let (rooms, backend, mut events) = setup();

    let created = rooms
        .create_room(None, RoomSpec::new("Arena", "Map1", 10))
        .await
        .unwrap();
    assert_eq!(created.state, RoomState::Loading);
    assert_eq!(rooms.get_room("Arena").await.unwrap().state, RoomState::Loading);

    let join = spawn_join(&rooms, conn(1), "Arena");
    settle(&rooms).await;
    assert!(!join.is_finished());
    assert_eq!(rooms.room_of_connection(conn(1)).await.unwrap(), None);

    backend.complete_when_ready().await;
    let joined = join.await.unwrap().unwrap();
    assert_eq!(joined.player_count, 1);
    assert_eq!(joined.state, RoomState::Active);

    let created = expect_event(&mut events, |e| matches!(e, RoomEvent::CreatedRoom(_))).await;
    assert!(matches!(created, RoomEvent::CreatedRoom(info) if info.name == "Arena"));
    let room = rooms.get_room("Arena").await.unwrap();
    assert_eq!(room.player_count, 1);
    assert!(room.world.is_some());
}

#[tokio::test]
async fn test_create_emits_state_changes_in_order() {
    let (rooms, _backend, mut events) = setup();

    let info = rooms
        .create_room(None, RoomSpec::headless("Chat", 50))
        .await
        .unwrap();
    assert_eq!(info.state, RoomState::Active);

    let id = info.room_id;
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(events.recv().await.unwrap());
    }
    assert_eq!(
        seen[0],
        RoomEvent::StateChanged {
            room: id,
            from: RoomState::Created,
            to: RoomState::Loading
        }
    );
    assert_eq!(
        seen[1],
        RoomEvent::StateChanged {
            room: id,
            from: RoomState::Loading,
            to: RoomState::Active
        }
    );
    assert!(matches!(&seen[2], RoomEvent::CreatedRoom(info) if info.room_id == id));
}

#[tokio::test]
async fn test_scenario_e_duplicate_name_leaves_registry_unchanged() {
    let (rooms, _backend, _events) = setup();

    rooms
        .create_room(None, RoomSpec::new("Arena", "Map1", 10))
        .await
        .unwrap();
    let err = rooms
        .create_room(None, RoomSpec::new("Arena", "Map2", 4))
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::NameTaken("Arena".into()));
    assert_eq!(rooms.list_rooms(|_| true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_create_has_no_side_effects() {
    let backend = ManualBackend::new();
    let rooms = RoomServerBuilder::new(backend.clone())
        .config(config())
        .room_validator(|_: Option<ConnectionId>, spec: &RoomSpec, _: &RoomRegistry| -> Result<(), String> {
            if spec.name.starts_with("lobby") {
                Err("lobby names are reserved".to_owned())
            } else {
                Ok(())
            }
        })
        .spawn();

    let err = rooms
        .create_room(None, RoomSpec::new("lobby-1", "Map1", 4))
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::AccessDenied("lobby names are reserved".into()));

    let err = rooms
        .create_room(None, RoomSpec::headless("Bad", 4).with_strategy(realm_scene::LoadStrategy::Single))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::InvalidSpec(_)));

    assert!(rooms.list_rooms(|_| true).await.unwrap().is_empty());
    assert!(backend.history().is_empty());
}

#[tokio::test]
async fn test_create_from_template_checks_category_and_capacity() {
    let (rooms, _backend, _events) = setup();

    let err = rooms
        .create_from_template(None, "race", "Race 1", None)
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::UnknownTemplate("race".into()));

    let err = rooms
        .create_from_template(None, "duel", "Duel 1", Some(3))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::AccessDenied(_)));

    let info = rooms
        .create_from_template(None, "duel", "Duel 1", None)
        .await
        .unwrap();
    assert_eq!(info.max_players, 2);
    assert_eq!(info.segment.as_deref(), Some("Pit"));
    assert_eq!(info.category.as_deref(), Some("duel"));
}

// =========================================================================
// Join and exit
// =========================================================================

#[tokio::test]
async fn test_scenario_b_third_join_into_full_room_fails() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Duo", "Map1", 2)).await;

    rooms.join_room(conn(1), "Duo", None).await.unwrap();
    rooms.join_room(conn(2), "Duo", None).await.unwrap();
    let err = rooms.join_room(conn(3), "Duo", None).await.unwrap_err();

    let room = rooms.get_room("Duo").await.unwrap();
    assert_eq!(err, RoomError::Full(room.room_id));
    assert_eq!(room.player_count, 2);
}

#[tokio::test]
async fn test_capacity_counts_parked_joins() {
    let (rooms, _backend, _events) = setup();
    let info = rooms
        .create_room(None, RoomSpec::new("Solo", "Map1", 1))
        .await
        .unwrap();

    let first = spawn_join(&rooms, conn(1), "Solo");
    settle(&rooms).await;
    let err = rooms.join_room(conn(2), "Solo", None).await.unwrap_err();
    assert_eq!(err, RoomError::Full(info.room_id));
    assert!(!first.is_finished());
}

#[tokio::test]
async fn test_connection_binds_to_one_room_at_a_time() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("A", "Map1", 4)).await;
    let a = rooms.get_room("A").await.unwrap().room_id;
    active_room(&rooms, &backend, &mut events, RoomSpec::new("B", "Map2", 4)).await;

    rooms.join_room(conn(1), "A", None).await.unwrap();
    let err = rooms.join_room(conn(1), "B", None).await.unwrap_err();
    assert_eq!(err, RoomError::AlreadyInRoom(conn(1), a));
    assert_eq!(rooms.get_room("B").await.unwrap().player_count, 0);
}

#[tokio::test]
async fn test_joined_event_fires_after_binding_is_visible() {
    let (rooms, backend, mut events) = setup();
    let room = active_room(&rooms, &backend, &mut events, RoomSpec::new("A", "Map1", 4)).await;

    rooms.join_room(conn(7), room.room_id, None).await.unwrap();
    let event = expect_event(&mut events, |e| matches!(e, RoomEvent::JoinedRoom { .. })).await;
    let RoomEvent::JoinedRoom { connection, room: joined, players } = event else {
        unreachable!()
    };
    assert_eq!((connection, joined, players), (conn(7), room.room_id, 1));
    let bound = rooms.room_of_connection(conn(7)).await.unwrap().unwrap();
    assert_eq!(bound.room_id, room.room_id);
}

#[tokio::test]
async fn test_private_room_requires_token() {
    let (rooms, backend, mut events) = setup();
    active_room(
        &rooms,
        &backend,
        &mut events,
        RoomSpec::new("Vault", "Map1", 4).private_with_token("hunter2"),
    )
    .await;

    let err = rooms.join_room(conn(1), "Vault", None).await.unwrap_err();
    assert!(matches!(err, RoomError::AccessDenied(reason) if reason.contains("private")));

    let info = rooms
        .join_room(conn(1), "Vault", Some("hunter2".into()))
        .await
        .unwrap();
    assert_eq!(info.player_count, 1);
}

#[tokio::test]
async fn test_private_room_without_token_refuses_every_join() {
    let (rooms, _backend, _events) = setup();
    let mut spec = RoomSpec::headless("Hidden", 4);
    spec.private = true;
    rooms.create_room(None, spec).await.unwrap();

    let err = rooms.join_room(conn(1), "Hidden", None).await.unwrap_err();
    assert!(matches!(err, RoomError::AccessDenied(reason) if reason.contains("private")));
    let err = rooms
        .join_room(conn(2), "Hidden", Some("anything".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::AccessDenied(_)));
    assert_eq!(rooms.get_room("Hidden").await.unwrap().player_count, 0);
}

#[tokio::test]
async fn test_join_unknown_room_is_not_found() {
    let (rooms, _backend, _events) = setup();
    let err = rooms.join_room(conn(1), "Nowhere", None).await.unwrap_err();
    assert_eq!(err, RoomError::NotFound(RoomTarget::Name("Nowhere".into())));
}

#[tokio::test]
async fn test_exit_without_binding_is_not_in_room() {
    let (rooms, _backend, _events) = setup();
    let err = rooms.exit_room(conn(1), true).await.unwrap_err();
    assert_eq!(err, RoomError::NotInRoom(conn(1)));
}

#[tokio::test]
async fn test_scenario_d_last_exit_unloads_then_destroys() {
    let (rooms, backend, mut events) = setup();
    let room = active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 10)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();

    let left = rooms.exit_room(conn(1), true).await.unwrap();
    assert_eq!(left.player_count, 0);
    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::ExitedRoom { connection, .. } if *connection == conn(1))
    })
    .await;

    // Unload queued, room not yet destroyed and no longer joinable.
    let closing = rooms.get_room("Arena").await.unwrap();
    assert_eq!(closing.state, RoomState::Closing);
    let err = rooms.join_room(conn(2), "Arena", None).await.unwrap_err();
    assert_eq!(err, RoomError::NotJoinable(room.room_id, RoomState::Closing));

    backend.wait_pending(1).await;
    assert!(matches!(backend.pending()[0], BackendCall::Unload { .. }));
    backend.complete_next();

    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::StateChanged { to: RoomState::Destroyed, .. })
    })
    .await;
    let err = rooms.get_room("Arena").await.unwrap_err();
    assert_eq!(err, RoomError::NotFound("Arena".into()));
}

#[tokio::test]
async fn test_exit_keeps_room_when_not_destroying() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 10)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();

    rooms.exit_room(conn(1), false).await.unwrap();
    let room = rooms.get_room("Arena").await.unwrap();
    assert_eq!(room.state, RoomState::Active);
    assert_eq!(room.player_count, 0);
}

#[tokio::test]
async fn test_persistent_room_survives_last_exit() {
    let (rooms, backend, mut events) = setup();
    active_room(
        &rooms,
        &backend,
        &mut events,
        RoomSpec::new("Hub", "Town", 10).persistent(),
    )
    .await;
    rooms.join_room(conn(1), "Hub", None).await.unwrap();
    rooms.exit_room(conn(1), true).await.unwrap();
    assert_eq!(rooms.get_room("Hub").await.unwrap().state, RoomState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_join_loading_room_times_out_after_retry_budget() {
    let backend = ManualBackend::new();
    let rooms = RoomServerBuilder::new(backend.clone())
        .config(RoomServerConfig {
            join_retry_limit: 3,
            join_retry_interval: Duration::from_millis(100),
            ..Default::default()
        })
        .spawn();
    let info = rooms
        .create_room(None, RoomSpec::new("Slow", "Map1", 4))
        .await
        .unwrap();

    let started = Instant::now();
    let err = rooms.join_room(conn(1), "Slow", None).await.unwrap_err();
    assert_eq!(err, RoomError::Timeout(info.room_id));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(rooms.room_of_connection(conn(1)).await.unwrap(), None);

    // The room itself is untouched and still loading.
    assert_eq!(rooms.get_room("Slow").await.unwrap().state, RoomState::Loading);
}

// =========================================================================
// Disconnect
// =========================================================================

#[tokio::test]
async fn test_disconnect_unbound_connection_is_idempotent() {
    let (rooms, _backend, _events) = setup();
    rooms.disconnect(conn(9)).await.unwrap();
    rooms.disconnect(conn(9)).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_twice_after_leaving_is_noop() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Hub", "Town", 10).persistent()).await;
    rooms.join_room(conn(1), "Hub", None).await.unwrap();

    rooms.disconnect(conn(1)).await.unwrap();
    expect_event(&mut events, |e| matches!(e, RoomEvent::DisconnectedRoom { .. })).await;
    rooms.disconnect(conn(1)).await.unwrap();
    rooms.disconnect(conn(1)).await.unwrap();

    assert_eq!(rooms.get_room("Hub").await.unwrap().player_count, 0);
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_disconnect_during_parked_join_waits_for_decision() {
    let (rooms, backend, mut events) = setup();
    rooms
        .create_room(None, RoomSpec::new("Arena", "Map1", 4))
        .await
        .unwrap();

    let join = spawn_join(&rooms, conn(1), "Arena");
    settle(&rooms).await;
    let disconnect = {
        let rooms = rooms.clone();
        tokio::spawn(async move { rooms.disconnect(conn(1)).await })
    };
    settle(&rooms).await;
    assert!(!disconnect.is_finished());

    backend.complete_when_ready().await;
    join.await.unwrap().unwrap();
    disconnect.await.unwrap().unwrap();

    let joined = expect_event(&mut events, |e| matches!(e, RoomEvent::JoinedRoom { .. })).await;
    assert!(matches!(joined, RoomEvent::JoinedRoom { connection, .. } if connection == conn(1)));
    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::DisconnectedRoom { connection, .. } if *connection == conn(1))
    })
    .await;
    assert_eq!(rooms.room_of_connection(conn(1)).await.unwrap(), None);
}

#[tokio::test]
async fn test_notify_disconnect_tears_down_empty_room() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();

    rooms.notify_disconnect(conn(1)).unwrap();
    expect_event(&mut events, |e| matches!(e, RoomEvent::DisconnectedRoom { .. })).await;
    assert_eq!(rooms.get_room("Arena").await.unwrap().state, RoomState::Closing);
}

// =========================================================================
// World segment changes
// =========================================================================

#[tokio::test]
async fn test_change_world_keeps_players_bound() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();

    rooms.change_world_segment("Arena", "Map2", true).await.unwrap();
    let room = rooms.get_room("Arena").await.unwrap();
    assert_eq!(room.state, RoomState::Loading);
    assert_eq!(room.player_count, 1);

    let unload = backend.complete_when_ready().await;
    assert!(matches!(unload, BackendCall::Unload { .. }));
    let load = backend.complete_when_ready().await;
    assert!(matches!(load, BackendCall::Load { ref segment, .. } if segment == "Map2"));

    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::StateChanged { from: RoomState::Loading, to: RoomState::Active, .. })
    })
    .await;
    let room = rooms.get_room("Arena").await.unwrap();
    assert_eq!(room.segment.as_deref(), Some("Map2"));
    assert_eq!(room.player_count, 1);
}

#[tokio::test]
async fn test_change_world_without_players_exits_everyone() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();
    rooms.join_room(conn(2), "Arena", None).await.unwrap();

    rooms.change_world_segment("Arena", "Map2", false).await.unwrap();
    for expected in [conn(1), conn(2)] {
        expect_event(&mut events, |e| {
            matches!(e, RoomEvent::ExitedRoom { connection, .. } if *connection == expected)
        })
        .await;
    }
    let room = rooms.get_room("Arena").await.unwrap();
    assert_eq!(room.player_count, 0);
    assert_eq!(room.state, RoomState::Loading);
}

#[tokio::test]
async fn test_concurrent_world_changes_second_is_busy() {
    let (rooms, backend, mut events) = setup();
    let room = active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4)).await;

    let (first, second) = tokio::join!(
        rooms.change_world_segment("Arena", "Map2", true),
        rooms.change_world_segment("Arena", "Map3", true),
    );
    assert_eq!(first, Ok(()));
    assert_eq!(second, Err(RoomError::Busy(room.room_id)));

    backend.complete_when_ready().await;
    backend.complete_when_ready().await;
    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::StateChanged { from: RoomState::Loading, to: RoomState::Active, .. })
    })
    .await;
    let room = rooms.get_room("Arena").await.unwrap();
    assert_eq!(room.segment.as_deref(), Some("Map2"));
    assert!(room.world.is_some());
}

#[tokio::test]
async fn test_change_world_on_loading_room_is_busy() {
    let (rooms, _backend, _events) = setup();
    let info = rooms
        .create_room(None, RoomSpec::new("Arena", "Map1", 4))
        .await
        .unwrap();
    let err = rooms
        .change_world_segment(info.room_id, "Map2", true)
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::Busy(info.room_id));
}

#[tokio::test]
async fn test_last_exit_during_world_change_destroys_room_once_loaded() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();

    rooms.change_world_segment("Arena", "Map2", true).await.unwrap();
    let left = rooms.exit_room(conn(1), true).await.unwrap();
    assert_eq!(left.player_count, 0);
    // Still mid-change; teardown waits for the new world.
    assert_eq!(rooms.get_room("Arena").await.unwrap().state, RoomState::Loading);

    let unload = backend.complete_when_ready().await;
    assert!(matches!(unload, BackendCall::Unload { .. }));
    let load = backend.complete_when_ready().await;
    assert!(matches!(load, BackendCall::Load { ref segment, .. } if segment == "Map2"));
    let teardown = backend.complete_when_ready().await;
    assert!(matches!(teardown, BackendCall::Unload { ref instance } if instance.segment == "Map2"));

    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::StateChanged { to: RoomState::Destroyed, .. })
    })
    .await;
    let err = rooms.get_room("Arena").await.unwrap_err();
    assert_eq!(err, RoomError::NotFound("Arena".into()));
}

#[tokio::test]
async fn test_single_world_in_use_refuses_second_single_room() {
    let (rooms, backend, mut events) = setup();
    let first = active_room(
        &rooms,
        &backend,
        &mut events,
        RoomSpec::new("Keep", "Map1", 4).with_strategy(LoadStrategy::Single),
    )
    .await;
    rooms.join_room(conn(1), "Keep", None).await.unwrap();

    let err = rooms
        .create_room(None, RoomSpec::new("Usurper", "Map2", 4).with_strategy(LoadStrategy::Single))
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::Busy(first.room_id));
    assert!(rooms.get_room("Usurper").await.is_err());

    let keep = rooms.get_room("Keep").await.unwrap();
    assert_eq!(keep.state, RoomState::Active);
    assert_eq!(keep.player_count, 1);
    assert_eq!(keep.world, first.world);
    assert_eq!(backend.history().len(), 1);
}

#[tokio::test]
async fn test_single_world_held_by_loading_room_is_busy() {
    let (rooms, _backend, _events) = setup();
    let first = rooms
        .create_room(None, RoomSpec::new("Keep", "Map1", 4).with_strategy(LoadStrategy::Single))
        .await
        .unwrap();

    let err = rooms
        .create_room(None, RoomSpec::new("Usurper", "Map2", 4).with_strategy(LoadStrategy::Single))
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::Busy(first.room_id));
}

#[tokio::test]
async fn test_single_world_empty_holder_is_torn_down_before_next_load() {
    let (rooms, backend, mut events) = setup();
    let first = active_room(
        &rooms,
        &backend,
        &mut events,
        RoomSpec::new("Old", "Map1", 4).with_strategy(LoadStrategy::Single),
    )
    .await;

    let next = rooms
        .create_room(None, RoomSpec::new("New", "Map2", 4).with_strategy(LoadStrategy::Single))
        .await
        .unwrap();
    assert_eq!(next.state, RoomState::Loading);
    assert_eq!(rooms.get_room("Old").await.unwrap().state, RoomState::Closing);

    let unload = backend.complete_when_ready().await;
    assert!(matches!(unload, BackendCall::Unload { ref instance } if instance.segment == "Map1"));
    let load = backend.complete_when_ready().await;
    assert!(matches!(load, BackendCall::Load { ref segment, .. } if segment == "Map2"));

    let old = first.room_id;
    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::StateChanged { room, to: RoomState::Destroyed, .. } if *room == old)
    })
    .await;
    expect_event(&mut events, |e| matches!(e, RoomEvent::CreatedRoom(i) if i.name == "New")).await;
    assert!(rooms.get_room("Old").await.is_err());
    // One unload only: the loader no longer tracks the torn-down world.
    assert_eq!(backend.history().len(), 3);
}

// =========================================================================
// Failures and supervisor close
// =========================================================================

#[tokio::test]
async fn test_failed_load_leaves_room_stuck_until_closed() {
    let (rooms, backend, mut events) = setup();
    let info = rooms
        .create_room(None, RoomSpec::new("Broken", "Missing", 4))
        .await
        .unwrap();

    assert_eq!(rooms.close_room(info.room_id).await, Err(RoomError::Busy(info.room_id)));

    backend.wait_pending(1).await;
    backend.fail_next("segment not found");
    let failed = expect_event(&mut events, |e| matches!(e, RoomEvent::SceneFailed { .. })).await;
    assert!(matches!(failed, RoomEvent::SceneFailed { reason, .. } if reason.contains("segment not found")));
    assert_eq!(rooms.get_room("Broken").await.unwrap().state, RoomState::Loading);

    let join = spawn_join(&rooms, conn(1), "Broken");
    settle(&rooms).await;

    rooms.close_room(info.room_id).await.unwrap();
    assert_eq!(
        join.await.unwrap().unwrap_err(),
        RoomError::NotFound(RoomTarget::Id(info.room_id))
    );
    assert!(rooms.get_room("Broken").await.is_err());
}

#[tokio::test]
async fn test_failed_teardown_unload_leaves_room_closing() {
    let (rooms, backend, mut events) = setup();
    let room = active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4)).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();
    rooms.disconnect(conn(1)).await.unwrap();

    backend.wait_pending(1).await;
    backend.fail_next("engine refused");
    expect_event(&mut events, |e| matches!(e, RoomEvent::SceneFailed { .. })).await;

    let stuck = rooms.get_room("Arena").await.unwrap();
    assert_eq!(stuck.state, RoomState::Closing);
    assert!(rooms.join_room(conn(2), "Arena", None).await.is_err());

    rooms.close_room(room.room_id).await.unwrap();
    assert!(rooms.get_room("Arena").await.is_err());
}

#[tokio::test]
async fn test_close_active_room_exits_players_and_unloads() {
    let (rooms, backend, mut events) = setup();
    let room = active_room(&rooms, &backend, &mut events, RoomSpec::new("Arena", "Map1", 4).persistent()).await;
    rooms.join_room(conn(1), "Arena", None).await.unwrap();

    rooms.close_room(room.room_id).await.unwrap();
    expect_event(&mut events, |e| matches!(e, RoomEvent::ExitedRoom { .. })).await;
    assert_eq!(rooms.room_of_connection(conn(1)).await.unwrap(), None);
    assert_eq!(rooms.get_room("Arena").await.unwrap().state, RoomState::Closing);

    backend.complete_when_ready().await;
    expect_event(&mut events, |e| {
        matches!(e, RoomEvent::StateChanged { to: RoomState::Destroyed, .. })
    })
    .await;
    assert!(rooms.get_room(room.room_id).await.is_err());
}

// =========================================================================
// Matchmaking
// =========================================================================

fn map(name: &str) -> Criteria {
    Criteria::from([("map".to_owned(), name.to_owned())])
}

#[tokio::test]
async fn test_scenario_c_second_request_joins_same_room() {
    let (rooms, backend, mut events) = setup();

    rooms
        .submit_match(vec![conn(1)], MatchStrategy::Attributes, map("X"))
        .await
        .unwrap();
    let placed = expect_event(&mut events, |e| matches!(e, RoomEvent::MatchPlaced { .. })).await;
    let RoomEvent::MatchPlaced { room, .. } = placed else {
        unreachable!()
    };
    let created = rooms.get_room(room).await.unwrap();
    assert_eq!(created.custom_data.get("map").map(String::as_str), Some("X"));
    assert_eq!(created.state, RoomState::Loading);

    rooms
        .submit_match(vec![conn(2)], MatchStrategy::Attributes, map("X"))
        .await
        .unwrap();
    let second = expect_event(&mut events, |e| matches!(e, RoomEvent::MatchPlaced { .. })).await;
    assert!(matches!(second, RoomEvent::MatchPlaced { room: r, .. } if r == room));
    assert_eq!(rooms.list_rooms(|_| true).await.unwrap().len(), 1);

    backend.complete_when_ready().await;
    for expected in [conn(1), conn(2)] {
        expect_event(&mut events, |e| {
            matches!(e, RoomEvent::JoinedRoom { connection, .. } if *connection == expected)
        })
        .await;
    }
    assert_eq!(rooms.get_room(room).await.unwrap().player_count, 2);
}

#[tokio::test]
async fn test_match_with_different_criteria_gets_own_room() {
    let (rooms, _backend, mut events) = setup();

    rooms
        .submit_match(vec![conn(1)], MatchStrategy::Attributes, map("X"))
        .await
        .unwrap();
    rooms
        .submit_match(vec![conn(2)], MatchStrategy::Attributes, map("Y"))
        .await
        .unwrap();

    let mut placed = Vec::new();
    for _ in 0..2 {
        if let RoomEvent::MatchPlaced { room, .. } =
            expect_event(&mut events, |e| matches!(e, RoomEvent::MatchPlaced { .. })).await
        {
            placed.push(room);
        }
    }
    assert_ne!(placed[0], placed[1]);
}

#[tokio::test]
async fn test_submit_match_rejects_bound_or_queued_connections() {
    let (rooms, backend, mut events) = setup();
    active_room(&rooms, &backend, &mut events, RoomSpec::new("Hub", "Town", 10).private_with_token("pw")).await;
    let hub = rooms
        .join_room(conn(1), "Hub", Some("pw".into()))
        .await
        .unwrap();

    let err = rooms
        .submit_match(vec![conn(1)], MatchStrategy::Any, Criteria::new())
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::AlreadyInRoom(conn(1), hub.room_id));

    let err = rooms
        .submit_match(vec![], MatchStrategy::Any, Criteria::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RoomError::InvalidSpec(_)));
}

#[tokio::test]
async fn test_cancel_match_removes_request() {
    let backend = ManualBackend::new();
    let rooms = RoomServerBuilder::new(backend)
        .config(config())
        .room_validator(refuse_all)
        .spawn();

    let ticket = rooms
        .submit_match(vec![conn(1)], MatchStrategy::Any, Criteria::new())
        .await
        .unwrap();
    let err = rooms.join_room(conn(1), "Anything", None).await.unwrap_err();
    assert_eq!(err, RoomError::AlreadyMatching(conn(1), ticket));

    assert!(rooms.cancel_match(ticket).await.unwrap());
    assert!(!rooms.cancel_match(ticket).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unplaced_match_request_expires() {
    let mut config = config();
    config.matchmaking.request_timeout = Duration::from_secs(5);
    let rooms = RoomServerBuilder::new(ManualBackend::new())
        .config(config)
        .room_validator(refuse_all)
        .spawn();
    let mut events = rooms.subscribe();

    let ticket = rooms
        .submit_match(vec![conn(1), conn(2)], MatchStrategy::Any, Criteria::new())
        .await
        .unwrap();
    let expired = expect_event(&mut events, |e| matches!(e, RoomEvent::MatchExpired { .. })).await;
    assert_eq!(
        expired,
        RoomEvent::MatchExpired {
            ticket,
            connections: vec![conn(1), conn(2)]
        }
    );
}

// =========================================================================
// Queries and shutdown
// =========================================================================

#[tokio::test]
async fn test_query_rooms_pages_and_filters() {
    let (rooms, _backend, _events) = setup();
    for name in ["alpha", "beta", "gamma"] {
        rooms
            .create_room(None, RoomSpec::headless(name, 4).with_data("mode", "chat"))
            .await
            .unwrap();
    }

    let mut query = RoomQuery {
        page_size: 2,
        ..Default::default()
    };
    query.filter.custom.insert("mode".into(), "chat".into());
    let page = rooms.query_rooms(query).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.rooms.len(), 2);
    assert_eq!(page.rooms[0].name, "alpha");
}

#[tokio::test]
async fn test_handle_reports_unavailable_after_shutdown() {
    let (rooms, _backend, _events) = setup();
    rooms.shutdown().await.unwrap();
    let err = rooms
        .create_room(None, RoomSpec::headless("Late", 4))
        .await
        .unwrap_err();
    assert_eq!(err, RoomError::Unavailable);
}
