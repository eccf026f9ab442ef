//! Property-based tests for the broker-level universal invariants in spec §8: capacity,
//! device uniqueness, and counter non-negativity. Buffer caps and demuxer round-trip already
//! have their own `proptest` coverage next to the code they test
//! (`core/src/output_buffer.rs`, `core/src/pty/demux.rs`); this file covers the invariants that
//! only the broker's registry/index bookkeeping can violate.

use std::sync::Arc;

use broker_core::broker::{CreateSessionOpts, SessionBroker};
use broker_core::config::BrokerConfig;
use broker_core::session::SessionStatus;
use broker_core::test_support::LoopbackPtySpawner;
use proptest::prelude::*;

const MAX_SESSIONS: usize = 3;
const DEVICES: &[&str] = &["d0", "d1"];

#[derive(Debug, Clone)]
enum Op {
    /// Create a session, optionally pinned to one of a small set of device ids (so device
    /// reuse/conflict actually gets exercised instead of every session being device-less).
    Create { device: Option<usize> },
    /// Attach to the `idx`-th session created so far (mod however many exist).
    Attach { idx: usize },
    /// Detach from the `idx`-th session created so far (mod however many exist).
    Detach { idx: usize },
    /// Kill the `idx`-th session created so far (mod however many exist).
    Kill { idx: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..=DEVICES.len()).prop_map(|d| Op::Create { device: if d == DEVICES.len() { None } else { Some(d) } }),
        (0usize..16).prop_map(|idx| Op::Attach { idx }),
        (0usize..16).prop_map(|idx| Op::Detach { idx }),
        (0usize..16).prop_map(|idx| Op::Kill { idx }),
    ]
}

/// Runs a random sequence of broker operations for a single user and checks, after every op,
/// that invariants 1 (capacity), 2 (device uniqueness — checked via the broker never creating
/// a second non-dead session for an already-claimed device), and 3 (counter non-negativity,
/// via the unsigned `connected_clients` type plus "never exceeds attaches-without-detaches")
/// all hold.
async fn run_ops(ops: Vec<Op>) {
    let config = BrokerConfig { max_sessions_per_user: MAX_SESSIONS, ..Default::default() };
    let broker = SessionBroker::new(config, Arc::new(LoopbackPtySpawner), None);
    let user = "alice";

    let mut created: Vec<broker_core::session::SessionId> = Vec::new();
    // Mirrors, per created session, how many outstanding attaches this test script believes it
    // has made (clamped at 0 same as the broker) so we can assert the broker's own counter never
    // drifts from "attaches issued minus detaches issued" in a way that goes negative or
    // over-counts beyond what Attach calls actually succeeded.
    let mut expected_clients: Vec<u32> = Vec::new();

    for op in ops {
        match op {
            Op::Create { device } => {
                let opts = CreateSessionOpts {
                    device_id: device.map(|d| DEVICES[d].to_string()),
                    ..Default::default()
                };
                match broker.create_session(user, opts).await {
                    Ok(session) => {
                        created.push(session.id);
                        expected_clients.push(0);
                    }
                    Err(_) => {
                        // CapacityExceeded or Conflict (device already claimed) — both are
                        // legitimate rejections, not invariant violations.
                    }
                }
            }
            Op::Attach { idx } => {
                if let Some(&id) = created.get(idx % created.len().max(1)) {
                    if broker.attach(id, user).is_ok() {
                        if let Some(slot) = created.iter().position(|&c| c == id) {
                            expected_clients[slot] += 1;
                        }
                    }
                }
            }
            Op::Detach { idx } => {
                if let Some(&id) = created.get(idx % created.len().max(1)) {
                    if broker.detach(id, user, None) {
                        if let Some(slot) = created.iter().position(|&c| c == id) {
                            expected_clients[slot] = expected_clients[slot].saturating_sub(1);
                        }
                    }
                }
            }
            Op::Kill { idx } => {
                if let Some(&id) = created.get(idx % created.len().max(1)) {
                    broker.kill(id, user).await;
                }
            }
        }

        // Invariant 1: capacity. Non-dead sessions for the user never exceed the configured cap.
        let non_dead = broker.list_by_user(user);
        assert!(non_dead.len() <= MAX_SESSIONS, "capacity invariant violated: {} > {MAX_SESSIONS}", non_dead.len());

        // Invariant 2: device uniqueness. At most one non-dead session per (user, device).
        let mut seen_devices = std::collections::HashSet::new();
        for info in &non_dead {
            if let Some(dev) = &info.device_id {
                assert!(seen_devices.insert(dev.clone()), "two non-dead sessions share device {dev}");
            }
        }

        // Invariant 3: connected_clients is never negative (guaranteed by the type) and never
        // exceeds the number of successful attaches minus successful detaches this script made.
        for (i, &id) in created.iter().enumerate() {
            if let Some(session) = broker.get(id) {
                if session.status() != SessionStatus::Dead {
                    assert!(
                        session.connected_clients() <= expected_clients[i],
                        "connected_clients {} exceeds attaches-minus-detaches {} for session {id}",
                        session.connected_clients(),
                        expected_clients[i]
                    );
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn broker_invariants_hold_under_random_operation_sequences(ops in proptest::collection::vec(op_strategy(), 0..60)) {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build current-thread runtime")
            .block_on(run_ops(ops));
    }
}
