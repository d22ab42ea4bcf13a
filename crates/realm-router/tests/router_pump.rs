//! Integration tests for pumping transport signals through the router.

use std::sync::{Arc, Mutex};

use realm_router::{ConnectionEventRouter, HandlerError, RouterError, ServerEvent};
use realm_transport::{ConnectionId, TransportEvent};
use tokio::sync::mpsc;

fn conn(id: u64) -> ConnectionId {
    ConnectionId::new(id)
}

#[tokio::test]
async fn test_attach_routes_events_in_arrival_order() {
    let router = Arc::new(ConnectionEventRouter::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = Arc::clone(&log);
    router.on_server_connect(move |id| {
        l.lock().unwrap().push(ServerEvent::Connect(id));
        Ok(())
    });
    let l = Arc::clone(&log);
    router.on_server_disconnect(move |id| {
        l.lock().unwrap().push(ServerEvent::Disconnect(id));
        Ok(())
    });
    let l = Arc::clone(&log);
    router.on_server_start(move || {
        l.lock().unwrap().push(ServerEvent::Start);
        Ok(())
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let pump = Arc::clone(&router).attach(rx);

    tx.send(TransportEvent::Listening { addr: None }).unwrap();
    for id in 1..=3 {
        tx.send(TransportEvent::Accepted {
            connection: conn(id),
            peer: None,
        })
        .unwrap();
    }
    tx.send(TransportEvent::Closed {
        connection: conn(2),
        reason: Some("reset".into()),
    })
    .unwrap();
    drop(tx);

    pump.await.unwrap().expect("pump should finish cleanly");
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ServerEvent::Start,
            ServerEvent::Connect(conn(1)),
            ServerEvent::Connect(conn(2)),
            ServerEvent::Connect(conn(3)),
            ServerEvent::Disconnect(conn(2)),
        ]
    );
}

#[tokio::test]
async fn test_attach_surfaces_subscriber_failure() {
    let router = Arc::new(ConnectionEventRouter::new());
    router.on_server_disconnect(|id| Err(HandlerError::new(format!("cannot release {id}"))));

    let (tx, rx) = mpsc::unbounded_channel();
    let pump = Arc::clone(&router).attach(rx);
    tx.send(TransportEvent::Closed {
        connection: conn(9),
        reason: None,
    })
    .unwrap();

    let result = pump.await.unwrap();
    match result {
        Err(RouterError::HandlerFailed { event, failures }) => {
            assert_eq!(event, ServerEvent::Disconnect(conn(9)));
            assert_eq!(failures[0].to_string(), "cannot release conn-9");
        }
        Ok(()) => panic!("expected the failure to propagate"),
    }
}
