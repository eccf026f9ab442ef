//! `HostPty`: a shell spawned locally with a pseudo-terminal (spec 4.2). Bridges
//! `portable_pty`'s blocking reader/writer onto async channels the same way a plain
//! `spawn_pty` helper would, generalized to the broker's `PtyHandle` contract (kill
//! escalation, write-after-exit is a no-op, exit delivered exactly once).

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::{mpsc, oneshot};

use crate::collaborators::PtySpawner;
use crate::error::{BrokerError, BrokerResult};
use crate::pty::{PtyHandle, SpawnedPty};

#[cfg(unix)]
const DEFAULT_SHELL: &str = "bash";
#[cfg(windows)]
const DEFAULT_SHELL: &str = "powershell.exe";

/// `$CONFIG ∪ {TERM=xterm-256color, COLORTERM=truecolor}` from spec 4.2.
fn base_env(extra: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut env = extra;
    env.push(("TERM".to_string(), "xterm-256color".to_string()));
    env.push(("COLORTERM".to_string(), "truecolor".to_string()));
    env
}

pub struct HostPty {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    alive: Arc<AtomicBool>,
    pty_grace: Duration,
    pid: Option<u32>,
}

#[async_trait]
impl PtyHandle for HostPty {
    fn write(&self, bytes: &[u8]) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.write_all(bytes);
            let _ = w.flush();
        }
    }

    async fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()> {
        let master = self.master.clone();
        tokio::task::spawn_blocking(move || {
            let guard = master.lock().map_err(|_| BrokerError::Unavailable("pty master poisoned".into()))?;
            guard
                .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
                .map_err(|e| BrokerError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }

    async fn kill(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let child = self.child.clone();
        let grace = self.pty_grace;
        tokio::task::spawn_blocking(move || {
            let mut guard = match child.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            // portable_pty's Child::kill is already the platform terminate signal; if the
            // process is still alive after PTY_GRACE, try again (the escalation spec 4.2 asks
            // for) before giving up.
            let _ = guard.kill();
            let deadline = std::time::Instant::now() + grace;
            while std::time::Instant::now() < deadline {
                match guard.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                    Err(_) => return,
                }
            }
            let _ = guard.kill();
        })
        .await
        .ok();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Spawns `bash -l` / `powershell.exe` at 80x24, in `cwd` or `$HOME`, merging `env` with the
/// TERM/COLORTERM pair spec 4.2 requires.
pub fn spawn_host_pty(
    shell: Option<&str>,
    cols: u16,
    rows: u16,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    pty_grace: Duration,
) -> BrokerResult<SpawnedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

    let mut cmd = CommandBuilder::new(shell.unwrap_or(DEFAULT_SHELL));
    #[cfg(unix)]
    if shell.is_none() {
        cmd.arg("-l");
    }
    for (k, v) in base_env(env) {
        cmd.env(k, v);
    }
    let home = cwd.or_else(|| std::env::var("HOME").ok().map(PathBuf::from));
    if let Some(dir) = home {
        cmd.cwd(dir);
    }

    let child = pair.slave.spawn_command(cmd).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
    let pid = child.process_id();
    let mut reader = pair.master.try_clone_reader().map_err(|e| BrokerError::Unavailable(e.to_string()))?;
    let writer = pair.master.take_writer().map_err(|e| BrokerError::Unavailable(e.to_string()))?;
    let master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>> = Arc::new(Mutex::new(pair.master));
    let child = Arc::new(Mutex::new(child));
    let alive = Arc::new(AtomicBool::new(true));

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(256);
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel::<i32>();
    let child_poll = Arc::clone(&child);
    let alive_poll = Arc::clone(&alive);
    std::thread::spawn(move || {
        let code = loop {
            let status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => return,
                };
                guard.try_wait()
            };
            match status {
                Ok(Some(status)) => break status.exit_code() as i32,
                Ok(None) => std::thread::sleep(Duration::from_millis(200)),
                Err(_) => return,
            }
        };
        alive_poll.store(false, Ordering::SeqCst);
        let _ = exit_tx.send(code);
    });

    let handle = HostPty { writer: Arc::new(Mutex::new(writer)), master, child, alive, pty_grace, pid };

    Ok(SpawnedPty { handle: Box::new(handle), output: out_rx, exit: exit_rx })
}

/// Default `PtySpawner` used in production (as opposed to tests, which use fakes).
pub struct DefaultPtySpawner {
    pub pty_grace: Duration,
}

#[async_trait]
impl PtySpawner for DefaultPtySpawner {
    async fn spawn(
        &self,
        shell: &str,
        _args: &[String],
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
        env: Vec<(String, String)>,
    ) -> BrokerResult<SpawnedPty> {
        let shell = if shell.is_empty() { None } else { Some(shell) };
        let pty_grace = self.pty_grace;
        tokio::task::spawn_blocking({
            let shell = shell.map(|s| s.to_string());
            move || spawn_host_pty(shell.as_deref(), cols, rows, cwd, env, pty_grace)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }
}
