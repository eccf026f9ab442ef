//! End-to-end scenarios against `SessionBroker`'s public API, exercised with the in-crate
//! `LoopbackPtySpawner` test double instead of a real shell or container (no `tests/`-level
//! counterpart is needed for demux framing — `core/src/pty/demux.rs` already covers that at
//! the unit level with both table-driven and property tests).

use std::sync::Arc;
use std::time::Duration;

use broker_core::broker::{CreateSessionOpts, SessionBroker};
use broker_core::config::BrokerConfig;
use broker_core::error::BrokerError;
use broker_core::session::SessionStatus;
use broker_core::test_support::LoopbackPtySpawner;

fn test_broker(config: BrokerConfig) -> Arc<SessionBroker> {
    SessionBroker::new(config, Arc::new(LoopbackPtySpawner), None)
}

async fn drain_until(rx: &mut tokio::sync::broadcast::Receiver<bytes::Bytes>, want: &[u8], timeout: Duration) -> bool {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while collected.len() < want.len() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(chunk)) => collected.extend_from_slice(&chunk),
            _ => return false,
        }
    }
    collected == want
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_write_and_receive_round_trips_bytes() {
    let broker = test_broker(BrokerConfig::default());
    let session = broker
        .create_session("alice", CreateSessionOpts::default())
        .await
        .expect("create succeeds");
    broker.attach(session.id, "alice").expect("attach succeeds");

    let (replay, mut live) = broker.subscribe_with_replay(session.id, 500).expect("session exists");
    assert!(replay.is_empty(), "nothing written yet");

    assert!(broker.write(session.id, b"echo hi\n"));
    assert!(drain_until(&mut live, b"echo hi\n", Duration::from_secs(1)).await);

    // spec 4.4's command scratch should have recorded the completed line.
    assert_eq!(session.last_command(), Some("echo hi".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_replays_exactly_the_prior_output() {
    let broker = test_broker(BrokerConfig::default());
    let session = broker
        .create_session("alice", CreateSessionOpts::default())
        .await
        .expect("create succeeds");
    broker.attach(session.id, "alice").expect("attach succeeds");

    let (_, mut first) = broker.subscribe_with_replay(session.id, 500).expect("session exists");
    assert!(broker.write(session.id, b"one\n"));
    assert!(drain_until(&mut first, b"one\n", Duration::from_secs(1)).await);
    assert!(broker.write(session.id, b"two\n"));
    assert!(drain_until(&mut first, b"two\n", Duration::from_secs(1)).await);
    drop(first);

    broker.detach(session.id, "alice", None);

    // A fresh attach's replay snapshot must contain exactly the bytes written before it, with
    // no gap and no duplication against whatever it sees live afterward (spec §8 properties 5/6).
    broker.attach(session.id, "alice").expect("re-attach succeeds");
    let (replay, mut live) = broker.subscribe_with_replay(session.id, 500).expect("session exists");
    let replayed: Vec<u8> = replay.into_iter().flat_map(|c| c.to_vec()).collect();
    assert_eq!(replayed, b"one\ntwo\n");

    assert!(broker.write(session.id, b"three\n"));
    assert!(drain_until(&mut live, b"three\n", Duration::from_secs(1)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_reuse_returns_the_same_session() {
    let broker = test_broker(BrokerConfig::default());
    let opts = CreateSessionOpts { device_id: Some("laptop".to_string()), ..Default::default() };
    let first = broker
        .get_or_create_for_device("alice", "laptop", opts)
        .await
        .expect("first call creates");

    let second = broker
        .get_or_create_for_device("alice", "laptop", CreateSessionOpts::default())
        .await
        .expect("second call reuses");

    assert_eq!(first.id, second.id, "same device must map to the same session");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capacity_is_enforced_per_user_and_frees_up_after_kill() {
    let config = BrokerConfig { max_sessions_per_user: 2, ..Default::default() };
    let broker = test_broker(config);

    let s1 = broker.create_session("alice", CreateSessionOpts::default()).await.expect("1st ok");
    let s2 = broker.create_session("alice", CreateSessionOpts::default()).await.expect("2nd ok");

    let err = broker
        .create_session("alice", CreateSessionOpts::default())
        .await
        .expect_err("3rd must be rejected");
    assert!(matches!(err, BrokerError::CapacityExceeded(user, 2) if user == "alice"));

    // Another user's quota is untouched.
    broker.create_session("bob", CreateSessionOpts::default()).await.expect("other user unaffected");

    assert!(broker.kill(s1.id, "alice").await);
    let s3 = broker
        .create_session("alice", CreateSessionOpts::default())
        .await
        .expect("capacity freed up after kill");
    assert_ne!(s3.id, s2.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cross_user_attach_and_kill_are_forbidden() {
    let broker = test_broker(BrokerConfig::default());
    let session = broker.create_session("alice", CreateSessionOpts::default()).await.expect("create ok");

    let err = broker.attach(session.id, "mallory").expect_err("must not attach to another user's session");
    assert!(matches!(err, BrokerError::Forbidden(_)));

    assert!(!broker.kill(session.id, "mallory").await, "kill must refuse a non-owner");
    assert!(broker.get(session.id).is_some(), "session must survive the forbidden kill attempt");

    assert!(broker.kill(session.id, "alice").await, "the owner's kill must succeed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_detached_sessions_are_reaped() {
    let config = BrokerConfig {
        reap_interval: Duration::from_millis(30),
        detached_ttl: Duration::from_millis(50),
        ..Default::default()
    };
    let broker = test_broker(config);
    broker.start_background_tasks();

    let session = broker.create_session("alice", CreateSessionOpts::default()).await.expect("create ok");
    broker.attach(session.id, "alice").expect("attach ok");
    broker.detach(session.id, "alice", None);
    assert_eq!(session.status(), SessionStatus::Detached);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(broker.get(session.id).is_none(), "reaper must have swept the idle session");
}
