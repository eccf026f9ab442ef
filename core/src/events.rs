//! Event-based observer fan-out, split across two buses rather than a single per-session
//! broadcast (spec §9): session lifecycle events
//! (`session_created` / `session_updated` / `session_deleted`) go on one broker-wide bus so
//! list-channel subscribers see every session; a session's own byte stream stays on its own
//! per-session bus (see `Session::subscribe_with_replay`) so one session's volume never
//! crowds out another's.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::{SessionId, SessionInfo};

/// Bounded per-subscriber queue depth (spec §5 default). A subscriber that falls this far
/// behind gets `RecvError::Lagged` on its next `recv`, which `ClientBridge` treats as "close
/// this transport" rather than resynchronizing — the broker never backpressures the session
/// to accommodate a slow client.
pub const LIVE_BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    SessionCreated { session: SessionInfo },
    SessionUpdated { session: SessionInfo, event_type: String },
    /// `exit_code` is `Some` when the deletion was caused by the PTY exiting on its own
    /// (spec 4.2's `OnExit(code)`) and `None` when it was an explicit `Kill` or a reaper
    /// sweep — there's no process exit code to report in those cases.
    SessionDeleted { session_id: SessionId, exit_code: Option<i32> },
}

/// Broker-wide lifecycle bus. `session_created` for S precedes any `session_updated` for S
/// precedes `session_deleted` for S on each subscriber (spec §5) because every publish goes
/// through this single sender and `tokio::sync::broadcast` preserves per-sender order.
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_BROADCAST_CAP);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BrokerEvent) {
        // No receivers is not an error: a broker with nobody on the list channel yet still
        // needs to run its reaper and emit events into the void.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
