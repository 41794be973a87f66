//! Backend that hosts every model in its own worker subprocess.
//!
//! The worker is started as
//!
//! ```text
//! <command> serve --family <family> --variant <variant> --device <device> --models-dir <dir>
//! ```
//!
//! and prints a line reading `READY` on stdout once the weights are on the device. After that
//! stdin and stdout carry binary frames:
//!
//! ```text
//! request: op (1 byte: 'R' run, 'C' reclaim cache) | length (u32 BE) | payload
//! reply:   status (1 byte: 0 ok, 1 error)          | length (u32 BE) | payload
//! ```
//!
//! An error reply carries a UTF-8 message. Closing stdin asks the worker to exit, which frees
//! all of its accelerator memory.
use bon::Builder;
use dashmap::DashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{BackendError, LoadedModel, ModelBackend};
use crate::catalog::Family;
use crate::hardware::Device;

pub const OP_RUN: u8 = b'R';
pub const OP_RECLAIM: u8 = b'C';
pub const STATUS_OK: u8 = 0;
pub const STATUS_ERR: u8 = 1;

const READY_LINE: &str = "READY";
const MAX_FRAME: usize = 512 * 1024 * 1024;

pub fn write_frame(w: &mut impl Write, tag: u8, payload: &[u8]) -> Result<(), BackendError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| BackendError::Io(format!("frame of {} bytes is too large", payload.len())))?;
    w.write_all(&[tag])?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame(r: &mut impl Read) -> Result<(u8, Vec<u8>), BackendError> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header)?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME {
        return Err(BackendError::Io(format!("reply frame of {len} bytes exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok((header[0], payload))
}

/// Decode a reply frame into the payload or the worker's error message.
fn reply_payload(status: u8, payload: Vec<u8>) -> Result<Vec<u8>, BackendError> {
    match status {
        STATUS_OK => Ok(payload),
        STATUS_ERR => Err(BackendError::Inference(
            String::from_utf8_lossy(&payload).into_owned(),
        )),
        other => Err(BackendError::Io(format!("unknown reply status {other}"))),
    }
}

struct WorkerIo {
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl WorkerIo {
    fn request(&mut self, op: u8, payload: &[u8]) -> Result<Vec<u8>, BackendError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BackendError::Io("worker input already closed".to_string()))?;
        write_frame(stdin, op, payload)?;
        let (status, reply) = read_frame(&mut self.stdout)?;
        reply_payload(status, reply)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Builder)]
pub struct ProcessBackend {
    #[builder(into)]
    command: String,
    #[builder(into)]
    models_dir: PathBuf,
    #[builder(default = Device::Cuda)]
    device: Device,
    /// How long an unloading worker may take to exit before it is killed.
    #[builder(default = Duration::from_secs(10))]
    exit_grace: Duration,
    #[builder(skip)]
    live: Arc<DashMap<String, Weak<Mutex<WorkerIo>>>>,
}

impl std::fmt::Debug for WorkerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerIo")
            .field("stdin_open", &self.stdin.is_some())
            .finish()
    }
}

impl ProcessBackend {
    fn spawn(&self, family: Family, variant: &str) -> Result<Child, BackendError> {
        Command::new(&self.command)
            .arg("serve")
            .args(["--family", family.as_str()])
            .args(["--variant", variant])
            .args(["--device", self.device.as_str()])
            .arg("--models-dir")
            .arg(&self.models_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BackendError::Load(format!("failed to spawn {}: {e}", self.command)))
    }
}

/// Consume stdout lines until the worker reports it is ready.
fn wait_ready(stdout: &mut BufReader<ChildStdout>, variant: &str) -> Result<(), BackendError> {
    let mut line = String::new();
    loop {
        line.clear();
        if stdout.read_line(&mut line)? == 0 {
            return Err(BackendError::Load(format!(
                "worker for {variant} exited before becoming ready"
            )));
        }
        let trimmed = line.trim();
        if trimmed == READY_LINE {
            return Ok(());
        }
        debug!(model = %variant, line = %trimmed, "Worker output before ready");
    }
}

impl ModelBackend for ProcessBackend {
    fn device(&self) -> Device {
        self.device
    }

    fn load(&self, family: Family, variant: &str) -> Result<Box<dyn LoadedModel>, BackendError> {
        info!(%family, model = %variant, command = %self.command, "Starting model worker");
        let mut child = self.spawn(family, variant)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::Load("worker pipes unavailable".to_string()));
        };
        let mut stdout = BufReader::new(stdout);

        if let Err(e) = wait_ready(&mut stdout, variant) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let io = Arc::new(Mutex::new(WorkerIo {
            stdin: Some(stdin),
            stdout,
        }));
        let key = format!("{family}/{variant}");
        self.live.insert(key.clone(), Arc::downgrade(&io));
        info!(%family, model = %variant, pid = child.id(), "Model worker ready");

        Ok(Box::new(WorkerModel {
            key,
            variant: variant.to_string(),
            io,
            child: Mutex::new(child),
            exit_grace: self.exit_grace,
            live: Arc::clone(&self.live),
        }))
    }

    fn reclaim(&self) {
        self.live.retain(|_, io| io.strong_count() > 0);
        for entry in self.live.iter() {
            let Some(io) = entry.value().upgrade() else {
                continue;
            };
            if let Err(e) = lock(&io).request(OP_RECLAIM, &[]) {
                warn!(worker = %entry.key(), error = %e, "Cache reclaim failed");
            }
        }
    }
}

struct WorkerModel {
    key: String,
    variant: String,
    io: Arc<Mutex<WorkerIo>>,
    child: Mutex<Child>,
    exit_grace: Duration,
    live: Arc<DashMap<String, Weak<Mutex<WorkerIo>>>>,
}

impl LoadedModel for WorkerModel {
    fn run(&self, input: &[u8]) -> Result<Vec<u8>, BackendError> {
        lock(&self.io).request(OP_RUN, input)
    }

    fn unload(self: Box<Self>) -> Result<(), BackendError> {
        self.live.remove(&self.key);
        // Closing stdin is the shutdown signal.
        lock(&self.io).stdin.take();

        let mut child = lock(&self.child);
        let deadline = Instant::now() + self.exit_grace;
        loop {
            match child.try_wait()? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => {
                    return Err(BackendError::Unload(format!(
                        "worker for {} exited with {status}",
                        self.variant
                    )));
                }
                None if Instant::now() >= deadline => {
                    warn!(model = %self.variant, "Worker did not exit in time, killing");
                    child.kill()?;
                    child.wait()?;
                    return Err(BackendError::Unload(format!(
                        "worker for {} had to be killed",
                        self.variant
                    )));
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl Drop for WorkerModel {
    fn drop(&mut self) {
        let mut child = lock(&self.child);
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
