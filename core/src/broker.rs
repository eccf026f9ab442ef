//! The singleton registry and scheduler (spec §4.5): create/lookup/attach/detach/kill,
//! per-user and per-device indices, idle reaper, event fan-out. Spec §9: "process-wide
//! singleton broker maps to a constructed-once instance passed by interface to collaborators;
//! no ambient state" — so this is an ordinary struct a binary constructs once and shares via
//! `Arc`, not a global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::collaborators::{ContainerRuntime, PtySpawner};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::events::{BrokerEvent, EventBus};
use crate::pty::container::spawn_container_pty;
use crate::pty::SpawnedPty;
use crate::session::{Session, SessionId, SessionInfo, SessionStatus};

/// Per-(user, device) key for the device-reuse index (spec invariant 4).
type DeviceKey = (String, String);

/// Inputs to `CreateSession` (spec 4.5). `cols`/`rows` aren't listed in §4.5's signature
/// table but every PTY needs an initial size; §4.2 states the default (80x24).
pub struct CreateSessionOpts {
    pub session_id: Option<SessionId>,
    pub name: Option<String>,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub device_id: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for CreateSessionOpts {
    fn default() -> Self {
        Self {
            session_id: None,
            name: None,
            working_dir: None,
            env: Vec::new(),
            device_id: None,
            cols: 80,
            rows: 24,
        }
    }
}

/// Structural state protected by one short, I/O-free critical section (spec §5): who holds
/// which session id, how many non-dead sessions each user has, and the device-reuse map. The
/// `sessions` map itself (the actual `Arc<Session>` handles) is a `DashMap` and is read
/// without this lock — only the bookkeeping that must stay consistent across the three
/// indices goes through it.
struct RegistryInner {
    reserved_ids: std::collections::HashSet<SessionId>,
    sessions_per_user: HashMap<String, usize>,
    by_device: HashMap<DeviceKey, SessionId>,
}

pub struct SessionBroker {
    config: BrokerConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    registry: Mutex<RegistryInner>,
    events: EventBus,
    dead_sessions: DashMap<SessionId, chrono::DateTime<Utc>>,
    reader_tasks: DashMap<SessionId, JoinHandle<()>>,
    pty_spawner: Arc<dyn PtySpawner>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    shutdown_notify: Notify,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionBroker {
    pub fn new(
        config: BrokerConfig,
        pty_spawner: Arc<dyn PtySpawner>,
        container_runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            registry: Mutex::new(RegistryInner {
                reserved_ids: Default::default(),
                sessions_per_user: HashMap::new(),
                by_device: HashMap::new(),
            }),
            events: EventBus::new(),
            dead_sessions: DashMap::new(),
            reader_tasks: DashMap::new(),
            pty_spawner,
            container_runtime,
            shutdown_notify: Notify::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Spawns the idle reaper (REAP_INTERVAL) and stale-connection auditor (AUDIT_INTERVAL).
    /// Call once after construction.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let reaper = self.clone();
        let reap_interval = self.config.reap_interval;
        let reaper_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => reaper.reap_tick().await,
                    _ = reaper.shutdown_notify.notified() => break,
                }
            }
        });

        let auditor = self.clone();
        let audit_interval = self.config.audit_interval;
        let auditor_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(audit_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => auditor.audit_tick(),
                    _ = auditor.shutdown_notify.notified() => break,
                }
            }
        });

        let mut bg = self.background.lock().expect("background mutex");
        bg.push(reaper_handle);
        bg.push(auditor_handle);
    }

    fn non_dead_count(&self, user_id: &str, registry: &RegistryInner) -> usize {
        *registry.sessions_per_user.get(user_id).unwrap_or(&0)
    }

    /// spec 4.5 CreateSession.
    pub async fn create_session(self: &Arc<Self>, user_id: &str, opts: CreateSessionOpts) -> BrokerResult<Arc<Session>> {
        let id = opts.session_id.unwrap_or_default();
        let device_id = opts.device_id.clone();

        // Phase 1: reserve capacity/id/device slot under the short registry lock. No I/O here.
        {
            let mut reg = self.registry.lock().expect("registry mutex");
            if self.sessions.contains_key(&id) || reg.reserved_ids.contains(&id) {
                return Err(BrokerError::Conflict(id.to_string()));
            }
            if self.non_dead_count(user_id, &reg) >= self.config.max_sessions_per_user {
                return Err(BrokerError::CapacityExceeded(user_id.to_string(), self.config.max_sessions_per_user));
            }
            if let Some(ref dev) = device_id {
                let key = (user_id.to_string(), dev.clone());
                if reg.by_device.contains_key(&key) {
                    return Err(BrokerError::Conflict(format!("device {dev} already has a session")));
                }
                reg.by_device.insert(key, id);
            }
            reg.reserved_ids.insert(id);
            *reg.sessions_per_user.entry(user_id.to_string()).or_insert(0) += 1;
        }

        // Phase 2: spawn the PTY (I/O, no lock held).
        let spawn_result = self.spawn_pty_for(user_id, &opts).await;
        let spawned = match spawn_result {
            Ok(s) => s,
            Err(e) => {
                self.undo_reservation(user_id, &device_id, id);
                return Err(e);
            }
        };

        let working_dir = opts.working_dir.clone().unwrap_or_default();
        let name = opts.name.unwrap_or_else(|| format!("session-{id}"));
        let session = Arc::new(Session::new(
            id,
            user_id.to_string(),
            device_id.clone(),
            name,
            working_dir,
            Arc::from(spawned.handle),
            self.config.max_output_chunks,
            self.config.max_output_bytes,
        ));

        self.sessions.insert(id, session.clone());
        {
            let mut reg = self.registry.lock().expect("registry mutex");
            reg.reserved_ids.remove(&id);
        }

        self.spawn_pty_reader(session.clone(), spawned.output, spawned.exit);

        tracing::info!(session_id = %id, %user_id, "session_created");
        self.events.publish(BrokerEvent::SessionCreated { session: session.info() });

        Ok(session)
    }

    fn undo_reservation(&self, user_id: &str, device_id: &Option<String>, id: SessionId) {
        let mut reg = self.registry.lock().expect("registry mutex");
        reg.reserved_ids.remove(&id);
        if let Some(count) = reg.sessions_per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
        }
        if let Some(dev) = device_id {
            reg.by_device.remove(&(user_id.to_string(), dev.clone()));
        }
    }

    async fn spawn_pty_for(&self, user_id: &str, opts: &CreateSessionOpts) -> BrokerResult<SpawnedPty> {
        if self.config.container_mode {
            let runtime = self
                .container_runtime
                .as_ref()
                .ok_or_else(|| BrokerError::Unavailable("container mode enabled with no runtime configured".into()))?;
            spawn_container_pty(runtime.as_ref(), user_id, opts.cols, opts.rows, opts.working_dir.clone(), opts.env.clone())
                .await
        } else {
            let cwd = opts.working_dir.clone().map(std::path::PathBuf::from);
            self.pty_spawner.spawn("", &[], opts.cols, opts.rows, cwd, opts.env.clone()).await
        }
    }

    fn spawn_pty_reader(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut output: tokio::sync::mpsc::Receiver<Bytes>,
        exit: tokio::sync::oneshot::Receiver<i32>,
    ) {
        let broker = Arc::downgrade(self);
        let session_id = session.id;
        let handle = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                session.append_output(chunk);
            }
            let code = exit.await.unwrap_or(-1);
            if let Some(broker) = broker.upgrade() {
                broker.on_pty_exit(session_id, code).await;
            }
        });
        self.reader_tasks.insert(session_id, handle);
    }

    /// Invoked when a session's PTY reader observes the output stream close and the exit
    /// signal fire. A no-op if the session was already removed by an explicit `Kill` (so
    /// `session_deleted` is never emitted twice for the same session — testable property 7).
    async fn on_pty_exit(&self, session_id: SessionId, exit_code: i32) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            session.set_status(SessionStatus::Dead);
            self.finish_removal(&session);
            tracing::info!(%session_id, exit_code, "session pty exited");
            self.events.publish(BrokerEvent::SessionDeleted { session_id, exit_code: Some(exit_code) });
        }
        self.reader_tasks.remove(&session_id);
    }

    fn finish_removal(&self, session: &Session) {
        self.dead_sessions.insert(session.id, Utc::now());
        let mut reg = self.registry.lock().expect("registry mutex");
        if let Some(count) = reg.sessions_per_user.get_mut(&session.user_id) {
            *count = count.saturating_sub(1);
        }
        if let Some(ref dev) = session.device_id {
            let key = (session.user_id.clone(), dev.clone());
            if reg.by_device.get(&key) == Some(&session.id) {
                reg.by_device.remove(&key);
            }
        }
    }

    /// spec 4.5 Attach.
    pub fn attach(&self, session_id: SessionId, user_id: &str) -> BrokerResult<Arc<Session>> {
        let session = self
            .sessions
            .get(&session_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| BrokerError::NotFound(session_id.to_string()))?;
        if session.status() == SessionStatus::Dead {
            return Err(BrokerError::NotFound(session_id.to_string()));
        }
        if session.user_id != user_id {
            return Err(BrokerError::Forbidden(session_id.to_string()));
        }
        session.mark_attached();
        self.events.publish(BrokerEvent::SessionUpdated {
            session: session.info(),
            event_type: "attach".to_string(),
        });
        Ok(session)
    }

    /// spec 4.5 GetOrCreateForDevice.
    pub async fn get_or_create_for_device(
        self: &Arc<Self>,
        user_id: &str,
        device_id: &str,
        mut opts: CreateSessionOpts,
    ) -> BrokerResult<Arc<Session>> {
        let existing = {
            let reg = self.registry.lock().expect("registry mutex");
            reg.by_device.get(&(user_id.to_string(), device_id.to_string())).copied()
        };
        if let Some(id) = existing {
            if let Some(session) = self.sessions.get(&id).map(|r| r.value().clone()) {
                if session.status() != SessionStatus::Dead {
                    return Ok(session);
                }
            }
        }

        // Proactively clean up this user's other idle (detached, zero-client) sessions on
        // different devices before creating a new one, per spec 4.5.
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|r| {
                let s = r.value();
                s.user_id == user_id
                    && s.status() == SessionStatus::Detached
                    && s.connected_clients() == 0
                    && s.device_id.as_deref() != Some(device_id)
            })
            .map(|r| *r.key())
            .collect();
        for id in stale {
            self.kill_internal(id).await;
        }

        opts.device_id = Some(device_id.to_string());
        self.create_session(user_id, opts).await
    }

    /// spec 4.5 Detach.
    pub fn detach(&self, session_id: SessionId, user_id: &str, device_id: Option<&str>) -> bool {
        let Some(session) = self.sessions.get(&session_id).map(|r| r.value().clone()) else {
            return false;
        };
        if session.user_id != user_id {
            return false;
        }
        session.mark_detached();
        self.events.publish(BrokerEvent::SessionUpdated {
            session: session.info(),
            event_type: "detach".to_string(),
        });

        if device_id.is_some() && session.device_id.as_deref() == device_id {
            let broker = self.clone_weak_self();
            let detach_reap = self.config.detach_reap;
            tokio::spawn(async move {
                tokio::time::sleep(detach_reap).await;
                if let Some(broker) = broker.upgrade() {
                    broker.reap_if_still_idle(session_id).await;
                }
            });
        }
        true
    }

    async fn reap_if_still_idle(&self, session_id: SessionId) {
        if let Some(session) = self.sessions.get(&session_id).map(|r| r.value().clone()) {
            if session.status() == SessionStatus::Detached && session.connected_clients() == 0 {
                self.kill_internal(session_id).await;
            }
        }
    }

    /// spec 4.5 Kill. Idempotent: killing an unknown or already-dead session returns false.
    pub async fn kill(&self, session_id: SessionId, user_id: &str) -> bool {
        let Some(session) = self.sessions.get(&session_id).map(|r| r.value().clone()) else {
            return false;
        };
        if session.user_id != user_id {
            return false;
        }
        self.kill_internal(session_id).await;
        true
    }

    /// Unconditional kill used internally by the reaper and device-reuse cleanup, which don't
    /// have (or need) a user id to authorize against — they already hold the session.
    async fn kill_internal(&self, session_id: SessionId) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };
        session.pty.kill().await;
        session.set_status(SessionStatus::Dead);
        self.finish_removal(&session);
        if let Some((_, handle)) = self.reader_tasks.remove(&session_id) {
            handle.abort();
        }
        tracing::info!(%session_id, "session_deleted");
        self.events.publish(BrokerEvent::SessionDeleted { session_id, exit_code: None });
    }

    /// spec 4.5 Write. Feeds the command scratch, forwards to the PTY, refreshes
    /// `lastActivity`. `false` if the session is absent or dead.
    pub fn write(self: &Arc<Self>, session_id: SessionId, bytes: &[u8]) -> bool {
        let Some(session) = self.sessions.get(&session_id).map(|r| r.value().clone()) else {
            return false;
        };
        let completed = session.feed_command_scratch(bytes);
        session.pty.write(bytes);
        session.touch();
        if !completed.is_empty() {
            for record in &completed {
                tracing::debug!(%session_id, command = %record.command, "command_recorded");
            }
            self.schedule_cwd_refresh(session_id);
        }
        true
    }

    fn schedule_cwd_refresh(self: &Arc<Self>, session_id: SessionId) {
        let broker = self.clone_weak_self();
        let delay = self.config.cwd_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(broker) = broker.upgrade() {
                broker.refresh_cwd(session_id).await;
            }
        });
    }

    async fn refresh_cwd(&self, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id).map(|r| r.value().clone()) else {
            return;
        };
        let Some(pid) = session.pty.pid() else {
            return;
        };
        let current = tokio::task::spawn_blocking(move || crate::cwd::read_cwd(pid)).await.ok().flatten();
        if let Some(new_dir) = current {
            if session.set_working_dir(new_dir) {
                self.events.publish(BrokerEvent::SessionUpdated {
                    session: session.info(),
                    event_type: "cwd".to_string(),
                });
            }
        }
    }

    /// spec 4.5 Resize.
    pub async fn resize(&self, session_id: SessionId, cols: u16, rows: u16) -> bool {
        let Some(session) = self.sessions.get(&session_id).map(|r| r.value().clone()) else {
            return false;
        };
        session.pty.resize(cols, rows).await.is_ok()
    }

    /// spec 4.5 Snapshot.
    pub fn snapshot(&self, session_id: SessionId, k: usize) -> Vec<Bytes> {
        self.sessions.get(&session_id).map(|r| r.snapshot(k)).unwrap_or_default()
    }

    /// Atomic snapshot + live subscription for a newly attached client (spec §8 properties 5
    /// and 6). Returns `None` if the session doesn't exist.
    pub fn subscribe_with_replay(&self, session_id: SessionId, k: usize) -> Option<(Vec<Bytes>, broadcast::Receiver<Bytes>)> {
        self.sessions.get(&session_id).map(|r| r.subscribe_with_replay(k))
    }

    /// spec 4.5 ListByUser.
    pub fn list_by_user(&self, user_id: &str) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .filter(|r| r.value().user_id == user_id && r.value().status() != SessionStatus::Dead)
            .map(|r| r.value().info())
            .collect()
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|r| r.value().clone())
    }

    async fn reap_tick(&self) {
        let dead_ttl = chrono::Duration::from_std(self.config.dead_ttl).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        let stale_dead: Vec<SessionId> = self
            .dead_sessions
            .iter()
            .filter(|r| now.signed_duration_since(*r.value()) > dead_ttl)
            .map(|r| *r.key())
            .collect();
        for id in stale_dead {
            self.dead_sessions.remove(&id);
        }

        let detached_ttl = chrono::Duration::from_std(self.config.detached_ttl).unwrap_or(chrono::Duration::zero());
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|r| {
                let s = r.value();
                s.status() == SessionStatus::Detached
                    && s.connected_clients() == 0
                    && now.signed_duration_since(s.last_activity()) > detached_ttl
            })
            .map(|r| *r.key())
            .collect();
        for id in expired {
            self.kill_internal(id).await;
        }

        // Purge orphaned device index entries (defensive: normal kill paths already clean
        // these up, but a crash mid-operation should never leave a dangling pointer around
        // forever).
        let mut reg = self.registry.lock().expect("registry mutex");
        reg.by_device.retain(|_, id| self.sessions.contains_key(id));
    }

    fn audit_tick(&self) {
        let threshold =
            chrono::Duration::from_std(self.config.stale_client_threshold).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        for r in self.sessions.iter() {
            let session = r.value();
            if session.status() == SessionStatus::Detached
                && session.connected_clients() > 0
                && now.signed_duration_since(session.last_activity()) > threshold
            {
                session.force_zero_clients();
                self.events.publish(BrokerEvent::SessionUpdated {
                    session: session.info(),
                    event_type: "stale_client_guard".to_string(),
                });
            }
        }
    }

    /// spec §5 graceful shutdown: mark all active sessions detached, zero counters, cancel
    /// reader tasks, wait at most SHUTDOWN_GRACE.
    pub async fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
        for r in self.sessions.iter() {
            let session = r.value();
            if session.status() == SessionStatus::Active {
                session.force_zero_clients();
                session.set_status(SessionStatus::Detached);
                self.events.publish(BrokerEvent::SessionUpdated {
                    session: session.info(),
                    event_type: "shutdown".to_string(),
                });
            }
        }
        for r in self.reader_tasks.iter() {
            r.value().abort();
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
        let mut bg = self.background.lock().expect("background mutex");
        for handle in bg.drain(..) {
            handle.abort();
        }
    }

    fn clone_weak_self(self: &Arc<Self>) -> std::sync::Weak<Self> {
        Arc::downgrade(self)
    }
}
