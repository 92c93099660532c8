mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use ricart::{Error, Message};

const WITHIN: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enters_once_every_peer_grants() {
    let dir = tempfile::tempdir().unwrap();
    let rows = [(1, free_port()), (2, free_port()), (3, free_port())];
    let (monitor, nodes) = cluster(dir.path(), &rows, Duration::from_millis(200), |config| config).await;

    assert!(nodes[0].enter_cs().await);
    assert!(eventually(WITHIN, || nodes[0].snapshot().executing).await);
    assert_eq!(nodes[0].inspect(|recorder| recorder.entered), 1);
    assert!(nodes[0].snapshot().waiting.is_empty());

    assert!(eventually(WITHIN, || !nodes[0].snapshot().interested).await);
    assert_eq!(monitor.entries(), vec![1]);
    assert_eq!(nodes[0].inspect(|recorder| recorder.exited), 1);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let rows = [(1, free_port()), (2, free_port()), (3, free_port())];
    let (monitor, nodes) = cluster(dir.path(), &rows, Duration::from_millis(50), |config| config).await;

    for round in 1..=3 {
        let (a, b, c) = tokio::join!(nodes[0].enter_cs(), nodes[1].enter_cs(), nodes[2].enter_cs());
        assert!(a && b && c);
        let done = eventually(WITHIN, || {
            monitor.entries().len() == 3 * round
                && nodes.iter().all(|node| !node.snapshot().interested)
        }).await;
        assert!(done, "round {} stalled: {:?}", round, monitor.entries());
    }

    assert!(!monitor.overlapped());
    for node in &nodes {
        assert_eq!(node.inspect(|recorder| recorder.entered), 3);
        assert!(node.snapshot().deferred.is_empty());
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn earlier_request_defers_later_one() {
    let dir = tempfile::tempdir().unwrap();

    // Node 3 holds back its vote for node 2 until told otherwise,
    // and grants node 1 straight away.
    let fake = Fake::start(|line| match line.split('~').collect::<Vec<_>>().as_slice() {
    | ["CSENTRY", "2", ..] => Some("DEFERRED~3~1".to_string()),
    | ["CSENTRY", ..] => Some("CSREPLY~3~1".to_string()),
    | ["HEARTBEAT", ..] => Some("HEARTBEAT_REPLY~3".to_string()),
    | _ => Some("GOTIT~1".to_string()),
    }).await;

    let (one, two) = (free_port(), free_port());
    let rows = [(1, one), (2, two), (3, fake.port)];
    write_store(dir.path(), 1, &rows);
    write_store(dir.path(), 2, &rows);
    let monitor = Arc::new(Monitor::default());
    let recorder = || Recorder { monitor: monitor.clone(), hold: Duration::from_millis(100), entered: 0, exited: 0 };
    let node1 = config(dir.path(), 1).run(recorder()).await.unwrap();
    let node2 = config(dir.path(), 2).run(recorder()).await.unwrap();

    assert!(node2.enter_cs().await);
    let waiting = node2.snapshot();
    assert!(waiting.interested);
    assert_eq!(waiting.waiting, vec![3]);

    assert!(node1.enter_cs().await);
    assert_eq!(node2.snapshot().deferred, vec![1]);
    assert!(node2.snapshot().request.unwrap() < node1.snapshot().request.unwrap());
    assert_eq!(node1.snapshot().waiting, vec![2]);
    assert!(!node1.snapshot().executing);

    // Release node 2; its exit must hand node 1 a belated grant.
    let mut raw = Raw::connect(two).await;
    assert!(raw.call("CSREPLY~3~50").await.starts_with("GOTIT~"));

    assert!(eventually(WITHIN, || node1.inspect(|recorder| recorder.entered) == 1).await);
    assert!(node2.snapshot().deferred.is_empty());
    assert!(eventually(WITHIN, || !node1.snapshot().interested).await);
    assert_eq!(monitor.entries(), vec![2, 1]);
    assert!(!monitor.overlapped());

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deferred_peers_get_exactly_one_grant() {
    let dir = tempfile::tempdir().unwrap();
    let two = Fake::start(voter(2)).await;
    let three = Fake::start(voter(3)).await;

    let port = free_port();
    write_store(dir.path(), 1, &[(1, port), (2, two.port), (3, three.port)]);
    let monitor = Arc::new(Monitor::default());
    let recorder = Recorder { monitor: monitor.clone(), hold: Duration::from_millis(300), entered: 0, exited: 0 };
    let node = config(dir.path(), 1).run(recorder).await.unwrap();

    assert!(node.enter_cs().await);
    assert!(eventually(WITHIN, || node.snapshot().executing).await);

    let mut raw = Raw::connect(port).await;
    assert!(raw.call("CSENTRY~2~100").await.starts_with("DEFERRED~1~"));
    assert!(raw.call("CSENTRY~3~101").await.starts_with("DEFERRED~1~"));
    assert_eq!(node.snapshot().deferred, vec![2, 3]);

    assert!(eventually(WITHIN, || two.count("CSREPLY") == 1 && three.count("CSREPLY") == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(two.count("CSREPLY"), 1);
    assert_eq!(three.count("CSREPLY"), 1);

    let snapshot = node.snapshot();
    assert!(snapshot.deferred.is_empty());
    assert!(!snapshot.executing);
    assert!(!snapshot.interested);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_voter_is_removed_and_requester_proceeds() {
    let dir = tempfile::tempdir().unwrap();
    let rows = [(1, free_port()), (2, free_port()), (3, free_port())];
    let tune = |config: ricart::Config| {
        config
            .with_heartbeat(Duration::from_millis(100))
            .with_timeout(Duration::from_millis(200))
            .with_misses(3)
    };
    let (_monitor, nodes) = cluster(dir.path(), &rows, Duration::from_millis(100), tune).await;

    // Let the heartbeat channels come up.
    assert!(eventually(WITHIN, || nodes[0].snapshot().channels == vec![2, 3]).await);

    nodes[2].shutdown().await;
    assert!(nodes[0].enter_cs().await);

    assert!(eventually(WITHIN, || nodes[0].inspect(|recorder| recorder.entered) == 1).await);
    let snapshot = nodes[0].snapshot();
    assert!(snapshot.members.iter().all(|(id, _)| *id != 3));
    assert!(!snapshot.channels.contains(&3));
    assert!(!snapshot.waiting.contains(&3));

    assert!(eventually(WITHIN, || nodes[1].snapshot().members.len() == 2).await);

    let stored = ricart::Storage::new(store_path(dir.path(), 1)).rows().unwrap();
    assert_eq!(stored.iter().map(|row| row.id).collect::<Vec<_>>(), vec![1, 2]);

    nodes[0].shutdown().await;
    nodes[1].shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_times_out_then_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let silent = Fake::start(|_: &str| None).await;

    let port = free_port();
    write_store(dir.path(), 1, &[(1, port), (2, silent.port)]);
    let monitor = Arc::new(Monitor::default());
    let recorder = Recorder { monitor, hold: Duration::from_millis(10), entered: 0, exited: 0 };
    let timeout = Duration::from_millis(300);
    let node = config(dir.path(), 1)
        .with_timeout(timeout)
        .with_heartbeat(Duration::from_millis(150))
        .with_misses(3)
        .run(recorder)
        .await
        .unwrap();

    let started = Instant::now();
    match node.send(2, Message::GotIt { timestamp: 0 }).await {
    | Err(Error::Timeout(_)) => (),
    | other => panic!("unexpected {:?}", other),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= timeout && elapsed < timeout * 3, "send took {:?}", elapsed);

    // One unanswered heartbeat is a miss, not a removal.
    assert!(eventually(WITHIN, || silent.count("HEARTBEAT") >= 1).await);
    assert!(node.snapshot().members.iter().any(|(id, _)| *id == 2));

    assert!(eventually(WITHIN, || node.snapshot().members.len() == 1).await);
    assert_eq!(silent.count("HEARTBEAT"), 3);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(silent.count("HEARTBEAT"), 3);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_interrupts_critical_section() {
    let dir = tempfile::tempdir().unwrap();
    let two = Fake::start(voter(2)).await;

    let port = free_port();
    write_store(dir.path(), 1, &[(1, port), (2, two.port)]);
    let monitor = Arc::new(Monitor::default());
    let recorder = Recorder { monitor, hold: Duration::from_secs(30), entered: 0, exited: 0 };
    let node = config(dir.path(), 1).run(recorder).await.unwrap();

    assert!(node.enter_cs().await);
    assert!(eventually(WITHIN, || node.snapshot().executing).await);
    let mut raw = Raw::connect(port).await;
    assert!(raw.call("CSENTRY~2~100").await.starts_with("DEFERRED~1~"));

    let started = Instant::now();
    node.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(node.inspect(|recorder| recorder.exited), 1);
    assert!(!node.snapshot().executing);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(two.count("CSREPLY"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_announcement_is_acknowledged_once_stored() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    write_store(dir.path(), 1, &[(1, port)]);
    let monitor = Arc::new(Monitor::default());
    let recorder = Recorder { monitor, hold: Duration::from_millis(10), entered: 0, exited: 0 };
    let node = config(dir.path(), 1).run(recorder).await.unwrap();

    let mut raw = Raw::connect(port).await;
    let announce = "NEW_NODE~4~127.0.0.1~9404~5";
    assert!(raw.call(announce).await.starts_with("New node added successfully.~"));
    let stored = std::fs::read_to_string(store_path(dir.path(), 1)).unwrap();
    assert!(raw.call(announce).await.starts_with("New node added successfully.~"));
    assert_eq!(std::fs::read_to_string(store_path(dir.path(), 1)).unwrap(), stored);
    assert_eq!(stored.matches("4 127.0.0.1 9404").count(), 1);
    assert_eq!(node.snapshot().members.len(), 2);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newcomer_announces_itself() {
    let dir = tempfile::tempdir().unwrap();
    let (one, two) = (free_port(), free_port());
    write_store(dir.path(), 1, &[(1, one)]);
    write_store(dir.path(), 2, &[(1, one), (2, two)]);
    let monitor = Arc::new(Monitor::default());
    let recorder = || Recorder { monitor: monitor.clone(), hold: Duration::from_millis(10), entered: 0, exited: 0 };
    let node1 = config(dir.path(), 1).run(recorder()).await.unwrap();
    let node2 = config(dir.path(), 2).run(recorder()).await.unwrap();

    let replies = node2.announce().await;
    assert_eq!(replies.len(), 1);
    match &replies[0] {
    | (1, Ok(Message::Ack { text, .. })) => assert_eq!(text, "New node added successfully."),
    | other => panic!("unexpected {:?}", other),
    }
    assert_eq!(node1.snapshot().members.len(), 2);
    let stored = ricart::Storage::new(store_path(dir.path(), 1)).rows().unwrap();
    assert!(stored.iter().any(|row| row.id == 2 && row.address.port == two));

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn odd_lines_get_generic_reply() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    write_store(dir.path(), 1, &[(1, port)]);
    let monitor = Arc::new(Monitor::default());
    let recorder = Recorder { monitor, hold: Duration::from_millis(10), entered: 0, exited: 0 };
    let node = config(dir.path(), 1).run(recorder).await.unwrap();

    let mut raw = Raw::connect(port).await;
    assert_eq!(raw.call("HEARTBEAT~9").await, "HEARTBEAT_REPLY~1");
    assert_eq!(node.snapshot().timestamp, 0);

    assert_eq!(raw.call("what is this").await, "Didn't get you~1");
    assert_eq!(raw.call("CSENTRY~x~y").await, "Didn't get you~2");
    assert_eq!(raw.call("CSENTRY~2~18446744073709551615").await, "Didn't get you~3");

    // The connection survives all of the above.
    assert_eq!(raw.call("HEARTBEAT~9").await, "HEARTBEAT_REPLY~1");

    node.shutdown().await;
}

#[tokio::test]
async fn startup_needs_own_entry() {
    let dir = tempfile::tempdir().unwrap();
    write_store(dir.path(), 1, &[(2, free_port())]);
    let monitor = Arc::new(Monitor::default());
    let recorder = Recorder { monitor, hold: Duration::from_millis(10), entered: 0, exited: 0 };
    match config(dir.path(), 1).run(recorder).await {
    | Err(Error::MissingSelf { id: 1, .. }) => (),
    | Err(other) => panic!("unexpected error {}", other),
    | Ok(_) => panic!("started without an entry for itself"),
    }
}
