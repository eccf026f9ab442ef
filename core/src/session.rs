//! The central entity (spec §3): one live interactive shell — identity, PTY handle, output
//! buffer, status, connected-client counter, timestamps, command scratch, and history.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::events::LIVE_BROADCAST_CAP;
use crate::output_buffer::OutputBuffer;
use crate::pty::PtyHandle;

/// Bounded in-memory command history depth. Not specified numerically by the data model (it
/// only says "bounded"); chosen generously since each record is a short string plus a
/// timestamp and the list is never persisted.
const HISTORY_CAP: usize = 500;

/// Opaque 128-bit identifier, unique per broker lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Detached,
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command: String,
    pub timestamp: DateTime<Utc>,
}

/// Projection returned to clients and to `ListByUser` (spec 4.5).
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user_id: String,
    pub device_id: Option<String>,
    pub name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub working_dir: String,
    pub connected_clients: u32,
    pub last_command: Option<String>,
    pub is_executing: bool,
}

struct ShellPromptPatterns {
    simple: Regex,
    bracketed: Regex,
    angle: Regex,
}

fn prompt_patterns() -> &'static ShellPromptPatterns {
    static PATTERNS: OnceLock<ShellPromptPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ShellPromptPatterns {
        simple: Regex::new(r"[\$%>#]\s*$").expect("valid regex"),
        bracketed: Regex::new(r"\[.*\]\s*[\$%>#]\s*$").expect("valid regex"),
        angle: Regex::new(r">\s*$").expect("valid regex"),
    })
}

/// Spec 4.5's three-step heuristic. Informational only (spec 9's Open Questions notes this
/// explicitly) — never treat its output as a correctness predicate.
pub fn is_executing(last_activity: DateTime<Utc>, now: DateTime<Utc>, recent_output: &[u8]) -> bool {
    let elapsed = now.signed_duration_since(last_activity);
    if elapsed < chrono::Duration::seconds(3) {
        return true;
    }
    let text = String::from_utf8_lossy(recent_output);
    let trimmed = text.trim_end();
    let patterns = prompt_patterns();
    let looks_like_prompt =
        patterns.simple.is_match(trimmed) || patterns.bracketed.is_match(trimmed) || patterns.angle.is_match(trimmed);
    if looks_like_prompt {
        return false;
    }
    elapsed < chrono::Duration::seconds(10)
}

struct SessionState {
    name: String,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    working_dir: String,
    connected_clients: u32,
    output: OutputBuffer,
    command_scratch: Vec<u8>,
    history: VecDeque<CommandRecord>,
}

/// One live interactive shell. Guarded by a single per-session mutex (spec §5): the PTY
/// reader task and broker operations both go through it, and critical sections never do I/O.
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub device_id: Option<String>,
    pub pty: Arc<dyn PtyHandle>,
    /// Live output fan-out. Unbuffered per-subscriber beyond `LIVE_BROADCAST_CAP`: a lagging
    /// subscriber gets `RecvError::Lagged` instead of stalling the session (spec §5 — "closes
    /// that subscriber's transport rather than backpressuring the session").
    live_tx: broadcast::Sender<Bytes>,
    state: Mutex<SessionState>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        user_id: String,
        device_id: Option<String>,
        name: String,
        working_dir: String,
        pty: Arc<dyn PtyHandle>,
        max_chunks: usize,
        max_bytes: usize,
    ) -> Self {
        let now = Utc::now();
        let (live_tx, _) = broadcast::channel(LIVE_BROADCAST_CAP);
        Self {
            id,
            user_id,
            device_id,
            pty,
            live_tx,
            state: Mutex::new(SessionState {
                name,
                // Starts detached with zero clients rather than transiently active: nobody
                // has attached yet, so invariant 2 (connectedClients=0 ∧ status=active is a
                // transient state, never an at-rest one) holds from the moment of creation.
                // `CreateSession` callers attach immediately afterward in the same logical op.
                status: SessionStatus::Detached,
                created_at: now,
                last_activity: now,
                working_dir,
                connected_clients: 0,
                output: OutputBuffer::new(max_chunks, max_bytes),
                command_scratch: Vec::new(),
                history: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session mutex poisoned")
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.lock().status = status;
    }

    pub fn connected_clients(&self) -> u32 {
        self.lock().connected_clients
    }

    /// Increment the connected-client counter and mark the session active (spec 4.5 Attach).
    pub fn mark_attached(&self) {
        let mut g = self.lock();
        g.connected_clients += 1;
        g.status = SessionStatus::Active;
        g.last_activity = Utc::now();
    }

    /// Decrement (floor 0); if it reaches 0 while active, transition to detached. Returns the
    /// resulting connected-client count.
    pub fn mark_detached(&self) -> u32 {
        let mut g = self.lock();
        g.connected_clients = g.connected_clients.saturating_sub(1);
        if g.connected_clients == 0 && g.status == SessionStatus::Active {
            g.status = SessionStatus::Detached;
        }
        g.connected_clients
    }

    /// Invariant 2's stale-connection guard: force the counter to 0 regardless of its value.
    pub fn force_zero_clients(&self) {
        self.lock().connected_clients = 0;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.lock().last_activity
    }

    pub fn touch(&self) {
        self.lock().last_activity = Utc::now();
    }

    pub fn working_dir(&self) -> String {
        self.lock().working_dir.clone()
    }

    /// Updates `working_dir` if it differs; returns whether it changed (so the caller knows
    /// whether to emit `session_updated`).
    pub fn set_working_dir(&self, dir: String) -> bool {
        let mut g = self.lock();
        if g.working_dir != dir {
            g.working_dir = dir;
            true
        } else {
            false
        }
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Appends to the output buffer, broadcasts to live subscribers, and refreshes
    /// `lastActivity` (the PTY reader's job, per spec invariant 6). The broadcast happens
    /// while still holding the session lock so it can never interleave with
    /// `subscribe_with_replay`'s snapshot-then-subscribe (no `.await` point inside the lock,
    /// so this stays a plain, non-blocking critical section).
    pub fn append_output(&self, chunk: Bytes) {
        let mut g = self.lock();
        g.output.append(chunk.clone());
        g.last_activity = Utc::now();
        let _ = self.live_tx.send(chunk);
    }

    /// Atomically takes a replay snapshot and subscribes to live output, so the subscriber
    /// sees no gap and no overlap between the two (spec §8 properties 5 and 6): any chunk
    /// appended after this call returns arrives only via the returned receiver, and the
    /// snapshot is exactly the prefix that preceded it.
    pub fn subscribe_with_replay(&self, k: usize) -> (Vec<Bytes>, broadcast::Receiver<Bytes>) {
        let g = self.lock();
        (g.output.snapshot(k), self.live_tx.subscribe())
    }

    pub fn output_size(&self) -> (usize, usize) {
        self.lock().output.size()
    }

    pub fn snapshot(&self, k: usize) -> Vec<Bytes> {
        self.lock().output.snapshot(k)
    }

    /// Feeds bytes written by a client into the command-scratch accumulator (spec 4.4).
    /// Returns the commands that were completed (pushed to history) by this call, in order —
    /// usually zero or one, but a single write can contain multiple newlines.
    pub fn feed_command_scratch(&self, bytes: &[u8]) -> Vec<CommandRecord> {
        let mut completed = Vec::new();
        let mut g = self.lock();
        for &b in bytes {
            match b {
                b'\r' | b'\n' => {
                    if !g.command_scratch.is_empty() {
                        let command = String::from_utf8_lossy(&g.command_scratch).trim().to_string();
                        g.command_scratch.clear();
                        if !command.is_empty() {
                            let record = CommandRecord { command, timestamp: Utc::now() };
                            g.history.push_back(record.clone());
                            while g.history.len() > HISTORY_CAP {
                                g.history.pop_front();
                            }
                            completed.push(record);
                        }
                    }
                }
                0x08 | 0x7f => {
                    g.command_scratch.pop();
                }
                b'\t' => {}
                c if c >= 32 => g.command_scratch.push(c),
                _ => {}
            }
        }
        completed
    }

    pub fn history(&self) -> Vec<CommandRecord> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn last_command(&self) -> Option<String> {
        self.lock().history.back().map(|r| r.command.clone())
    }

    pub fn info(&self) -> SessionInfo {
        let g = self.lock();
        let now = Utc::now();
        let recent: Vec<u8> = g.output.snapshot(3).into_iter().flat_map(|c| c.to_vec()).collect();
        SessionInfo {
            id: self.id,
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            name: g.name.clone(),
            status: g.status,
            created_at: g.created_at,
            last_activity: g.last_activity,
            working_dir: g.working_dir.clone(),
            connected_clients: g.connected_clients,
            last_command: g.history.back().map(|r| r.command.clone()),
            is_executing: is_executing(g.last_activity, now, &recent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NoopPty;

    fn session() -> Session {
        Session::new(SessionId::new(), "u1".into(), None, "t".into(), "/".into(), NoopPty::arc(), 100, 1024)
    }

    #[test]
    fn prompt_detection_marks_not_executing_after_grace_period() {
        let now = Utc::now();
        let last_activity = now - chrono::Duration::seconds(20);
        assert!(!is_executing(last_activity, now, b"myhost:~$ "));
        assert!(!is_executing(last_activity, now, b"[user@host dir]$ "));
        assert!(is_executing(last_activity, now, b"compiling...\n"));
    }

    #[test]
    fn recent_activity_always_counts_as_executing() {
        let now = Utc::now();
        let last_activity = now - chrono::Duration::milliseconds(500);
        assert!(is_executing(last_activity, now, b"$ "));
    }

    #[test]
    fn command_scratch_records_on_newline_and_trims() {
        let session = session();
        let completed = session.feed_command_scratch(b"  echo hi  \n");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].command, "echo hi");
        assert_eq!(session.last_command(), Some("echo hi".to_string()));
    }

    #[test]
    fn backspace_drops_last_byte() {
        let session = session();
        session.feed_command_scratch(b"echoo");
        session.feed_command_scratch(&[0x7f]);
        session.feed_command_scratch(b"\n");
        assert_eq!(session.last_command(), Some("echo".to_string()));
    }

    #[test]
    fn tab_is_ignored_until_enter() {
        let session = session();
        session.feed_command_scratch(b"ls\t\n");
        assert_eq!(session.last_command(), Some("ls".to_string()));
    }

    #[test]
    fn multiple_newlines_in_one_write_record_multiple_commands() {
        let session = session();
        let completed = session.feed_command_scratch(b"one\ntwo\n");
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].command, "one");
        assert_eq!(completed[1].command, "two");
    }

    #[test]
    fn detach_then_attach_transitions_correctly() {
        let session = session();
        session.mark_attached();
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.connected_clients(), 1);
        session.mark_detached();
        assert_eq!(session.status(), SessionStatus::Detached);
        assert_eq!(session.connected_clients(), 0);
    }
}
