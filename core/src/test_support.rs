//! Small fakes shared by unit tests and the crate's `tests/` integration suite. Kept as a
//! plain (non-`cfg(test)`) module, the way `tobias-walle-agency`'s dedicated `test-support`
//! crate is an ordinary dependency rather than a `dev-dependencies`-only shim — integration
//! tests in `tests/` are a separate compilation unit and need these as real public items.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::collaborators::PtySpawner;
use crate::error::BrokerResult;
use crate::pty::{PtyHandle, SpawnedPty};

/// A `PtyHandle` that records nothing and does nothing — enough to construct a `Session` in
/// tests that only exercise scratch/history/status logic, not real I/O.
pub struct NoopPty {
    alive: AtomicBool,
}

impl NoopPty {
    pub fn arc() -> Arc<dyn PtyHandle> {
        Arc::new(Self { alive: AtomicBool::new(true) })
    }
}

#[async_trait]
impl PtyHandle for NoopPty {
    fn write(&self, _bytes: &[u8]) {}

    async fn resize(&self, _cols: u16, _rows: u16) -> BrokerResult<()> {
        Ok(())
    }

    async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// A `PtyHandle` that echoes every `write` straight back onto its own output channel, standing
/// in for a real shell the way a loopback socket stands in for a network peer. Good enough to
/// exercise the broker's buffering/replay/fan-out plumbing (spec §8's E1/E2/E4/E5/E7) without a
/// real child process — `SPEC_FULL.md`'s integration suite asks for exactly this.
struct LoopbackPty {
    output_tx: mpsc::Sender<Bytes>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

#[async_trait]
impl PtyHandle for LoopbackPty {
    fn write(&self, bytes: &[u8]) {
        let _ = self.output_tx.try_send(Bytes::copy_from_slice(bytes));
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> BrokerResult<()> {
        Ok(())
    }

    async fn kill(&self) {
        if let Some(tx) = self.exit_tx.lock().expect("exit_tx mutex").take() {
            let _ = tx.send(-1);
        }
    }
}

/// A `PtySpawner` that hands out `LoopbackPty` handles instead of spawning a real shell.
pub struct LoopbackPtySpawner;

#[async_trait]
impl PtySpawner for LoopbackPtySpawner {
    async fn spawn(
        &self,
        _shell: &str,
        _args: &[String],
        _cols: u16,
        _rows: u16,
        _cwd: Option<PathBuf>,
        _env: Vec<(String, String)>,
    ) -> BrokerResult<SpawnedPty> {
        let (output_tx, output_rx) = mpsc::channel(256);
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle: Box<dyn PtyHandle> = Box::new(LoopbackPty { output_tx, exit_tx: Mutex::new(Some(exit_tx)) });
        Ok(SpawnedPty { handle, output: output_rx, exit: exit_rx })
    }
}
