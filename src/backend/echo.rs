//! In-process backend that performs no inference.
//!
//! Useful for running the server without an accelerator and for observing what the
//! scheduling layers do: every load, unload, run and reclaim is recorded in order, and the
//! number of operations inside the backend at once is tracked.
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BackendError, LoadedModel, ModelBackend};
use crate::catalog::Family;
use crate::hardware::Device;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Load { family: Family, variant: String },
    Unload { family: Family, variant: String },
    RunStart { family: Family, variant: String, input: Vec<u8> },
    RunEnd { family: Family, variant: String },
    Reclaim,
}

#[derive(Debug, Default)]
struct EchoState {
    events: Mutex<Vec<BackendEvent>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    run_delay: Mutex<Duration>,
    load_delay: Mutex<Duration>,
    fail_load: Mutex<HashSet<String>>,
    fail_unload: Mutex<HashSet<String>>,
    fail_run: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EchoState {
    fn record(&self, event: BackendEvent) {
        lock(&self.events).push(event);
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard { state: self }
    }
}

struct ActiveGuard<'a> {
    state: &'a EchoState,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend that echoes its input back.
///
/// Caption models return a short UTF-8 description instead of the raw input so that callers
/// expecting text get text.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    device: Device,
    state: Arc<EchoState>,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new(Device::Cpu)
    }
}

impl EchoBackend {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: Arc::new(EchoState::default()),
        }
    }

    /// Sleep this long inside every run, to widen race windows.
    pub fn with_run_delay(self, delay: Duration) -> Self {
        self.set_run_delay(delay);
        self
    }

    /// Like [`EchoBackend::with_run_delay`], for a backend that is already shared.
    pub fn set_run_delay(&self, delay: Duration) {
        *lock(&self.state.run_delay) = delay;
    }

    /// Sleep this long inside every load.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        *lock(&self.state.load_delay) = delay;
        self
    }

    pub fn fail_load(&self, variant: &str) {
        lock(&self.state.fail_load).insert(variant.to_string());
    }

    pub fn fail_unload(&self, variant: &str) {
        lock(&self.state.fail_unload).insert(variant.to_string());
    }

    pub fn fail_run(&self, variant: &str) {
        lock(&self.state.fail_run).insert(variant.to_string());
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        lock(&self.state.events).clone()
    }

    /// Highest number of operations observed inside the backend at the same time.
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    /// Inputs of every run, in the order the runs started.
    pub fn run_inputs(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BackendEvent::RunStart { input, .. } => Some(input),
                _ => None,
            })
            .collect()
    }
}

impl ModelBackend for EchoBackend {
    fn device(&self) -> Device {
        self.device
    }

    fn load(&self, family: Family, variant: &str) -> Result<Box<dyn LoadedModel>, BackendError> {
        let _active = self.state.enter();
        let delay = *lock(&self.state.load_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if lock(&self.state.fail_load).contains(variant) {
            return Err(BackendError::Load(format!("{variant} refused to load")));
        }
        self.state.record(BackendEvent::Load {
            family,
            variant: variant.to_string(),
        });
        Ok(Box::new(EchoModel {
            family,
            variant: variant.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    fn reclaim(&self) {
        self.state.record(BackendEvent::Reclaim);
    }
}

struct EchoModel {
    family: Family,
    variant: String,
    state: Arc<EchoState>,
}

impl LoadedModel for EchoModel {
    fn run(&self, input: &[u8]) -> Result<Vec<u8>, BackendError> {
        let _active = self.state.enter();
        self.state.record(BackendEvent::RunStart {
            family: self.family,
            variant: self.variant.clone(),
            input: input.to_vec(),
        });

        let delay = *lock(&self.state.run_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let result = if lock(&self.state.fail_run).contains(&self.variant) {
            Err(BackendError::Inference(format!("{} failed", self.variant)))
        } else if self.family == Family::Caption {
            Ok(format!("{} caption of {} bytes", self.variant, input.len()).into_bytes())
        } else {
            Ok(input.to_vec())
        };

        self.state.record(BackendEvent::RunEnd {
            family: self.family,
            variant: self.variant.clone(),
        });
        result
    }

    fn unload(self: Box<Self>) -> Result<(), BackendError> {
        let _active = self.state.enter();
        self.state.record(BackendEvent::Unload {
            family: self.family,
            variant: self.variant.clone(),
        });
        if lock(&self.state.fail_unload).contains(&self.variant) {
            return Err(BackendError::Unload(format!("{} refused to unload", self.variant)));
        }
        Ok(())
    }
}
