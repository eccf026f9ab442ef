//! The three external interfaces the broker consumes (spec §1, §6). Production bindings for
//! these (real container engine, real identity service) are out of the core's scope — it only
//! needs the trait. Each trait ships an in-memory test double so broker tests never need a
//! real shell, container runtime, or auth backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{BrokerError, BrokerResult};

/// Resolves a connection's bearer credential to a user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> BrokerResult<String>;
}

/// An in-memory `token -> userId` map, for tests and local development.
#[derive(Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, String>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, token: &str) -> BrokerResult<String> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| BrokerError::Forbidden("invalid credential".to_string()))
    }
}

/// Parameters for opening an interactive exec session inside a container, per spec 4.2.
pub struct ExecOpts {
    pub cmd: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
    pub tty: bool,
    pub cols: u16,
    pub rows: u16,
}

/// A live hijacked exec stream: byte output channel, write/resize/kill. Mirrors the shape of
/// `PtyHandle` because the whole point of `ContainerPty` is to make this look like one.
#[async_trait]
pub trait ExecSession: Send + Sync {
    fn writer(&self) -> Box<dyn Fn(&[u8]) -> BrokerResult<()> + Send + Sync>;
    fn take_output(&mut self) -> mpsc::Receiver<Bytes>;
    async fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()>;
    async fn kill(&self) -> BrokerResult<()>;
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (or reuse) the user's container, returning its id.
    async fn ensure_user_container(&self, user_id: &str) -> BrokerResult<String>;

    /// Open an interactive exec session with AttachStdin/Stdout/Stderr + Tty all true.
    async fn open_exec(&self, container_id: &str, opts: ExecOpts) -> BrokerResult<Box<dyn ExecSession>>;
}

/// A fake container runtime backed by real `HostPty`-style child processes, so tests can
/// exercise the `ContainerPty` / demuxer path without a real container engine. Each "container"
/// is just the user id; each exec session frames its stdout with the 8-byte header so the
/// demuxer has real framing to parse, matching what a hijacked docker exec stream looks like.
pub struct FakeContainerRuntime {
    containers: Mutex<HashMap<String, String>>,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self { containers: Mutex::new(HashMap::new()) }
    }
}

impl Default for FakeContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn ensure_user_container(&self, user_id: &str) -> BrokerResult<String> {
        let mut containers = self.containers.lock().expect("containers mutex");
        Ok(containers
            .entry(user_id.to_string())
            .or_insert_with(|| format!("container-{user_id}"))
            .clone())
    }

    async fn open_exec(&self, container_id: &str, opts: ExecOpts) -> BrokerResult<Box<dyn ExecSession>> {
        crate::pty::fake_exec::spawn(container_id, opts)
    }
}

/// Spawns a local shell with a PTY.
#[async_trait]
pub trait PtySpawner: Send + Sync {
    async fn spawn(
        &self,
        shell: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
        env: Vec<(String, String)>,
    ) -> BrokerResult<crate::pty::SpawnedPty>;
}
