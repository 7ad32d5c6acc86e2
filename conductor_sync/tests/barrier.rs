//! End-to-end barrier tests: one coordinator, N in-process peer clients.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use conductor_core::scenario::ScenarioParser;
use conductor_core::schedule::ScenarioRunner;
use conductor_sync::{ClientConfig, Coordinator, CoordinatorConfig, SyncClient, SyncError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn test_config(addr: &str, peers: usize) -> CoordinatorConfig {
    CoordinatorConfig::new(addr, peers)
        .with_post_delay(Duration::from_millis(50))
        .with_grace_period(Duration::from_millis(500))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_distributes_distinct_ids_and_identical_tables() {
    let coordinator = Coordinator::bind(test_config("127.0.0.1:0", 3)).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    let barrier = tokio::spawn(coordinator.run());

    let mut peers = Vec::new();
    for slot in 0..3 {
        let config = ClientConfig::new(addr.to_string())
            .with_var("slot", slot.to_string())
            .with_retry(5, Duration::from_millis(100));
        peers.push(tokio::spawn(async move {
            SyncClient::new(config).rendezvous().await.unwrap()
        }));
    }

    let mut synced = Vec::new();
    for handle in peers {
        synced.push(handle.await.unwrap());
    }

    let mut ids: Vec<_> = synced.iter().map(|s| s.peer_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    let reference = synced[0].table.clone();
    for peer in &synced {
        assert_eq!(peer.table, reference);
        assert_eq!(peer.table.len(), 3);
        // Every peer's uploaded metadata is visible to everyone.
        let slots: Vec<_> = peer
            .table
            .peers
            .values()
            .map(|r| r.vars["slot"].clone())
            .collect();
        assert_eq!(slots.len(), 3);
        // Our own measured clock offset is in our record.
        let own = peer.record().unwrap();
        assert!(own.clock_offset.abs() < 5.0, "offset {}", own.clock_offset);
    }

    // Disconnecting is the final acknowledgment; the coordinator then
    // reports success.
    drop(synced);
    let report = barrier.await.unwrap().unwrap();
    assert_eq!(report.peers, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_peer_barrier_works() {
    let coordinator = Coordinator::bind(test_config("127.0.0.1:0", 1)).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    let barrier = tokio::spawn(coordinator.run());

    let synced = SyncClient::new(ClientConfig::new(addr.to_string()))
        .rendezvous()
        .await
        .unwrap();
    assert_eq!(synced.peer_id, 1);
    assert_eq!(synced.table.len(), 1);

    drop(synced);
    assert!(barrier.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_drive_fires_in_order_after_barrier() {
    let coordinator = Coordinator::bind(test_config("127.0.0.1:0", 1)).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    let barrier = tokio::spawn(coordinator.run());

    let mut runner = ScenarioRunner::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    for action in ["first", "second", "third", "everyone"] {
        let sink = Arc::clone(&calls);
        runner.register(action, move |e| {
            sink.lock().unwrap().push(e.action.clone());
        });
    }
    runner.add_events(ScenarioParser::new().parse_str(
        "0:00 first {1}\n0:00 second\n0:00.05 third {1-4}\n0:00.01 everyone {!2}\n",
        "inline",
    ));

    let synced = SyncClient::new(ClientConfig::new(addr.to_string()))
        .rendezvous()
        .await
        .unwrap();
    synced.drive(&runner).await;

    assert_eq!(
        *calls.lock().unwrap(),
        vec!["first", "second", "everyone", "third"]
    );

    drop(synced);
    let _ = barrier.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drive_skips_events_beyond_timer_range() {
    use conductor_core::scenario::ScenarioEvent;
    use conductor_core::PeerFilter;

    let coordinator = Coordinator::bind(test_config("127.0.0.1:0", 1)).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    let barrier = tokio::spawn(coordinator.run());

    // The parser rejects offsets like this, but events added from code
    // can still carry them; the driver must skip, not panic.
    let mut runner = ScenarioRunner::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    for action in ["near", "far"] {
        let sink = Arc::clone(&calls);
        runner.register(action, move |e| {
            sink.lock().unwrap().push(e.action.clone());
        });
    }
    runner.add_events([
        ScenarioEvent {
            file: "inline".into(),
            line: 1,
            offset: 0.0,
            action: "near".into(),
            args: Vec::new(),
            kwargs: Default::default(),
            filter: PeerFilter::All,
        },
        ScenarioEvent {
            file: "inline".into(),
            line: 2,
            offset: 2.0e19,
            action: "far".into(),
            args: Vec::new(),
            kwargs: Default::default(),
            filter: PeerFilter::All,
        },
    ]);

    let synced = SyncClient::new(ClientConfig::new(addr.to_string()))
        .rendezvous()
        .await
        .unwrap();
    synced.drive(&runner).await;

    assert_eq!(*calls.lock().unwrap(), vec!["near"]);

    drop(synced);
    let _ = barrier.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_action_halts_remaining_events() {
    let coordinator = Coordinator::bind(test_config("127.0.0.1:0", 1)).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    let barrier = tokio::spawn(coordinator.run());

    let mut runner = ScenarioRunner::new();
    let calls = Arc::new(Mutex::new(Vec::new()));
    for action in ["before", "after"] {
        let sink = Arc::clone(&calls);
        runner.register(action, move |e| {
            sink.lock().unwrap().push(e.action.clone());
        });
    }
    let stop = runner.stop_flag();
    runner.register("halt", move |_e| {
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
    });
    runner.add_events(ScenarioParser::new().parse_str(
        "0:00 before\n0:00 halt\n0:00 after\n0:00.05 after\n",
        "inline",
    ));

    let synced = SyncClient::new(ClientConfig::new(addr.to_string()))
        .rendezvous()
        .await
        .unwrap();
    synced.drive(&runner).await;

    assert_eq!(*calls.lock().unwrap(), vec!["before"]);

    drop(synced);
    let _ = barrier.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_violation_closes_connection_and_barrier_times_out() {
    let config = test_config("127.0.0.1:0", 1).with_grace_period(Duration::from_millis(200));
    let coordinator = Coordinator::bind(config).await.unwrap();
    let addr = coordinator.local_addr().unwrap();
    let barrier = tokio::spawn(coordinator.run());

    // Readiness before the clock line is out of phase: the coordinator
    // must close this connection.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"ready\n").await.unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected the coordinator to close the connection");

    // The lone expected connection is gone, so the barrier fails once the
    // grace period expires.
    match barrier.await.unwrap() {
        Err(SyncError::BarrierFailed { ready: 0, expected: 1 }) => {}
        other => panic!("expected barrier failure, got {other:?}"),
    }
}
