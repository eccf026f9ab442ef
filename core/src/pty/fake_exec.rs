//! Test-only `ExecSession` backing `FakeContainerRuntime`: a real local PTY process whose
//! stdout is framed with the same 8-byte header a hijacked docker exec stream uses, so tests
//! exercise the genuine `ExecStreamDemuxer` path end to end instead of mocking it away.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::collaborators::{ExecOpts, ExecSession};
use crate::error::{BrokerError, BrokerResult};

fn frame(kind: u8, payload: &[u8]) -> Bytes {
    let mut v = Vec::with_capacity(8 + payload.len());
    v.push(kind);
    v.extend_from_slice(&[0, 0, 0]);
    v.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    v.extend_from_slice(payload);
    Bytes::from(v)
}

pub struct FakeExecSession {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    alive: Arc<AtomicBool>,
    output: Option<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl ExecSession for FakeExecSession {
    fn writer(&self) -> Box<dyn Fn(&[u8]) -> BrokerResult<()> + Send + Sync> {
        let writer = self.writer.clone();
        let alive = self.alive.clone();
        Box::new(move |bytes: &[u8]| {
            if !alive.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Ok(mut w) = writer.lock() {
                let _ = w.write_all(bytes);
                let _ = w.flush();
            }
            Ok(())
        })
    }

    fn take_output(&mut self) -> mpsc::Receiver<Bytes> {
        self.output.take().expect("take_output called twice")
    }

    async fn resize(&self, cols: u16, rows: u16) -> BrokerResult<()> {
        let master = self.master.clone();
        tokio::task::spawn_blocking(move || {
            let guard = master.lock().map_err(|_| BrokerError::Unavailable("exec master poisoned".into()))?;
            guard
                .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
                .map_err(|e| BrokerError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }

    async fn kill(&self) -> BrokerResult<()> {
        self.alive.store(false, Ordering::SeqCst);
        let child = self.child.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = child.lock() {
                let _ = guard.kill();
            }
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }
}

pub fn spawn(_container_id: &str, opts: ExecOpts) -> BrokerResult<Box<dyn ExecSession>> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize { rows: opts.rows, cols: opts.cols, pixel_width: 0, pixel_height: 0 })
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

    let program = opts.cmd.first().cloned().unwrap_or_else(|| "/bin/bash".to_string());
    let mut cmd = CommandBuilder::new(&program);
    for arg in opts.cmd.iter().skip(1) {
        cmd.arg(arg);
    }
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }
    cmd.cwd(&opts.working_dir);

    let child = pair.slave.spawn_command(cmd).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
    let mut reader = pair.master.try_clone_reader().map_err(|e| BrokerError::Unavailable(e.to_string()))?;
    let writer = pair.master.take_writer().map_err(|e| BrokerError::Unavailable(e.to_string()))?;

    let (tx, rx) = mpsc::channel::<Bytes>(256);
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(frame(1, &buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Ok(Box::new(FakeExecSession {
        writer: Arc::new(Mutex::new(writer)),
        master: Arc::new(Mutex::new(pair.master)),
        child: Arc::new(Mutex::new(child)),
        alive: Arc::new(AtomicBool::new(true)),
        output: Some(rx),
    }))
}
