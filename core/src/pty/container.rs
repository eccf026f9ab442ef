//! `ContainerPty`: a PTY-like handle backed by a container runtme's hijacked exec stream,
//! demultiplexed through `ExecStreamDemuxer` (spec 4.2). Everything downstream of
//! `spawn_container_pty` — the session, the reader task, the broker — sees the exact same
//! `PtyHandle`/`SpawnedPty` shape as `HostPty`; that uniformity is the whole point of the
//! trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::collaborators::{ContainerRuntime, ExecOpts, ExecSession};
use crate::error::BrokerResult;
use crate::pty::demux::ExecStreamDemuxer;
use crate::pty::{PtyHandle, SpawnedPty};

pub struct ContainerPty {
    write_fn: Box<dyn Fn(&[u8]) -> BrokerResult<()> + Send + Sync>,
    exec: Arc<AsyncMutex<Box<dyn ExecSession>>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl PtyHandle for ContainerPty {
    fn write(&self, bytes: &[u8]) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let _ = (self.write_fn)(bytes);
    }

    async fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()> {
        let exec = self.exec.lock().await;
        exec.resize(cols, rows).await
    }

    async fn kill(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let exec = self.exec.lock().await;
        let _ = exec.kill().await;
    }
}

/// Opens an exec session against the user's container — creating it on demand — with
/// `{AttachStdin, AttachStdout, AttachStderr, Tty} = true`, `user=developer`,
/// `workingDir=/home/developer` (or override), `command=["/bin/bash"]` (spec 4.2), and wraps
/// its hijacked stream in `ExecStreamDemuxer` on read.
pub async fn spawn_container_pty(
    runtime: &dyn ContainerRuntime,
    user_id: &str,
    cols: u16,
    rows: u16,
    working_dir: Option<String>,
    env: Vec<(String, String)>,
) -> BrokerResult<SpawnedPty> {
    let container_id = runtime.ensure_user_container(user_id).await?;
    let opts = ExecOpts {
        cmd: vec!["/bin/bash".to_string()],
        user: "developer".to_string(),
        working_dir: working_dir.unwrap_or_else(|| "/home/developer".to_string()),
        env,
        tty: true,
        cols,
        rows,
    };
    let mut exec = runtime.open_exec(&container_id, opts).await?;
    let mut raw_rx = exec.take_output();
    let write_fn = exec.writer();

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(256);
    let (exit_tx, exit_rx) = oneshot::channel::<i32>();

    tokio::spawn(async move {
        let mut demuxer = ExecStreamDemuxer::new();
        while let Some(raw) = raw_rx.recv().await {
            for chunk in demuxer.feed(&raw) {
                if out_tx.send(chunk.data).await.is_err() {
                    return;
                }
            }
        }
        // A hijacked exec stream carries no separate exit-code channel in this interface; the
        // stream closing is the only exit signal we get, so we report a clean exit. A runtime
        // that can report a real exit code should do so through a richer `ExecSession`.
        demuxer.close();
        let _ = exit_tx.send(0);
    });

    let alive = Arc::new(AtomicBool::new(true));
    let handle = ContainerPty { write_fn, exec: Arc::new(AsyncMutex::new(exec)), alive };

    Ok(SpawnedPty { handle: Box::new(handle), output: out_rx, exit: exit_rx })
}
