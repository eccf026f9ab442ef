//! Uniform capability over either a host PTY or a demultiplexed container-exec stream
//! (spec 4.2). `PtyHandle` is the capability object; `SpawnedPty` is what a spawn function
//! returns alongside it — the output stream and exit signal are channels, not trait methods,
//! because only one task (the session's PTY reader) is ever allowed to drain them.

pub mod container;
pub mod demux;
pub mod host;

pub(crate) mod fake_exec;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::BrokerResult;

/// `Read`, `Write`, `Resize`, `Kill` from spec 3's PtyHandle capability. `OnExit` is modeled
/// as a channel (`SpawnedPty::exit`) rather than a trait method, since it fires at most once
/// and is naturally a future, not a pollable method.
#[async_trait]
pub trait PtyHandle: Send + Sync {
    /// Forward bytes verbatim. Atomic per call: no interleaving with another caller's write.
    /// A no-op once the PTY has exited or been killed — dropped, not erroneous.
    fn write(&self, bytes: &[u8]);

    /// Set the PTY window size. Idempotent.
    async fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()>;

    /// Terminate the underlying process/stream. Safe to call more than once.
    async fn kill(&self);

    /// OS process id backing this handle, when there is a local one to ask `/proc` or `lsof`
    /// about (spec 4.4's cwd-refresh mechanism). `None` for container-exec streams, whose
    /// filesystem lives inside the container rather than on the broker host.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Everything a spawn function hands back: the capability plus its output byte stream and
/// exit signal, which the caller's PTY reader task owns exclusively.
pub struct SpawnedPty {
    pub handle: Box<dyn PtyHandle>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<i32>,
}
