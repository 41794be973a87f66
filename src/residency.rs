//! Model residency - decides which model occupies accelerator memory
//!
//! Swappable families hold at most one resident variant. Asking for a different variant
//! unloads the current one, reclaims the accelerator cache, and only then loads the new one,
//! so the two are never live together. Every transition for a family happens under that
//! family's exclusive lock.
//!
//! Preloaded families are loaded once at startup and never evicted; `ensure` for them is a
//! membership check.
//!
//! ```text
//! Unloaded ─▶ Loading ─▶ Resident(A) ─▶ Unloading ─▶ Unloaded ─▶ Loading ─▶ Resident(B)
//! ```
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendError, LoadedModel, ModelBackend};
use crate::catalog::{Family, Preload, Residency};
use crate::hardware::Device;

/// Residency state of a swappable family
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "model", rename_all = "lowercase")]
pub enum ResidencyState {
    Unloaded,
    Loading(String),
    Resident(String),
    Unloading(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{family} model '{variant}' is not available (loaded: {})", .available.join(", "))]
    NotAvailable {
        family: Family,
        variant: String,
        available: Vec<String>,
    },

    #[error("failed to load {family} model '{variant}': {source}")]
    Backend {
        family: Family,
        variant: String,
        source: BackendError,
    },

    #[error("failed to unload {family} model '{variant}': {source}")]
    Unload {
        family: Family,
        variant: String,
        source: BackendError,
    },

    #[error("{family} worker for '{variant}' died: {reason}")]
    Worker {
        family: Family,
        variant: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// `run` was called without a successful `ensure` for the same variant. This is a bug in
    /// the caller, not a runtime failure.
    #[error("{family} model '{variant}' is not resident (current: {current:?})")]
    NotResident {
        family: Family,
        variant: String,
        current: Option<String>,
    },

    #[error("{family} model '{variant}' failed: {source}")]
    Backend {
        family: Family,
        variant: String,
        source: BackendError,
    },

    #[error("{family} worker for '{variant}' died: {reason}")]
    Worker {
        family: Family,
        variant: String,
        reason: String,
    },
}

struct Resident {
    variant: String,
    handle: Box<dyn LoadedModel>,
}

type Slot = Arc<Mutex<Option<Resident>>>;

/// Per-family state for a swappable family.
struct SwapEntry {
    /// Exclusive lock; holds the handle itself.
    slot: Slot,
    /// Snapshot for observers that must not wait on the lock.
    state: Arc<RwLock<ResidencyState>>,
}

/// Resets the observed state to `Unloaded` unless the transition committed.
///
/// If a swap task panics mid-transition this keeps the state from being stuck in `Loading` or
/// `Unloading`.
struct Transition {
    state: Arc<RwLock<ResidencyState>>,
    committed: bool,
}

impl Transition {
    fn begin(state: &Arc<RwLock<ResidencyState>>, next: ResidencyState) -> Self {
        set_state(state, next);
        Self {
            state: Arc::clone(state),
            committed: false,
        }
    }

    fn commit(mut self, next: ResidencyState) {
        set_state(&self.state, next);
        self.committed = true;
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        if !self.committed {
            set_state(&self.state, ResidencyState::Unloaded);
        }
    }
}

fn set_state(state: &RwLock<ResidencyState>, next: ResidencyState) {
    *state.write().unwrap_or_else(|p| p.into_inner()) = next;
}

/// Snapshot of one resident model, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentModel {
    pub family: Family,
    pub variant: String,
    pub device: Device,
}

struct ResidencyInner {
    backend: Arc<dyn ModelBackend>,
    swappable: HashMap<Family, SwapEntry>,
    preloaded: DashMap<(Family, String), Arc<Box<dyn LoadedModel>>>,
    preload_lock: Mutex<()>,
}

/// Owns every loaded model handle.
#[derive(Clone)]
pub struct ModelResidency {
    inner: Arc<ResidencyInner>,
}

impl std::fmt::Debug for ModelResidency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelResidency")
            .field("backend", &self.inner.backend)
            .finish_non_exhaustive()
    }
}

impl ModelResidency {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        let swappable = Family::ALL
            .into_iter()
            .filter(|f| f.residency() == Residency::Swappable)
            .map(|f| {
                (
                    f,
                    SwapEntry {
                        slot: Arc::new(Mutex::new(None)),
                        state: Arc::new(RwLock::new(ResidencyState::Unloaded)),
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(ResidencyInner {
                backend,
                swappable,
                preloaded: DashMap::new(),
                preload_lock: Mutex::new(()),
            }),
        }
    }

    pub fn device(&self) -> Device {
        self.inner.backend.device()
    }

    /// State of a swappable family. Preloaded families always report `Unloaded`.
    pub fn state(&self, family: Family) -> ResidencyState {
        match self.inner.swappable.get(&family) {
            Some(entry) => entry.state.read().unwrap_or_else(|p| p.into_inner()).clone(),
            None => ResidencyState::Unloaded,
        }
    }

    /// The resident variant of a swappable family, if any.
    pub fn current(&self, family: Family) -> Option<String> {
        match self.state(family) {
            ResidencyState::Resident(variant) => Some(variant),
            _ => None,
        }
    }

    /// Names served by a preloaded family, sorted.
    pub fn loaded(&self, family: Family) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .preloaded
            .iter()
            .filter(|entry| entry.key().0 == family)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// Every model currently holding accelerator memory.
    pub fn resident_models(&self) -> Vec<ResidentModel> {
        let device = self.device();
        let mut models = Vec::new();
        for family in Family::ALL {
            let variants = match family.residency() {
                Residency::Swappable => self.current(family).into_iter().collect(),
                Residency::Preloaded => self.loaded(family),
            };
            models.extend(variants.into_iter().map(|variant| ResidentModel {
                family,
                variant,
                device,
            }));
        }
        models.sort_by(|a, b| (a.family.as_str(), &a.variant).cmp(&(b.family.as_str(), &b.variant)));
        models
    }

    /// Load every entry of a preload plan that is not loaded yet.
    pub async fn preload(&self, plan: &[Preload]) -> Result<(), LoadError> {
        let _guard = self.inner.preload_lock.lock().await;

        for item in plan {
            if item.family.residency() != Residency::Preloaded {
                warn!(family = %item.family, model = %item.variant, "Ignoring preload of swappable family");
                continue;
            }
            if self
                .inner
                .preloaded
                .contains_key(&(item.family, item.variant.clone()))
            {
                continue;
            }

            info!(family = %item.family, model = %item.variant, serves = ?item.serves, "Preloading model");
            let handle = load_blocking(
                Arc::clone(&self.inner.backend),
                item.family,
                item.variant.clone(),
            )
            .await?;
            let handle = Arc::new(handle);
            for name in &item.serves {
                self.inner
                    .preloaded
                    .insert((item.family, name.clone()), Arc::clone(&handle));
            }
        }
        Ok(())
    }

    /// Make `variant` the resident model of `family`.
    ///
    /// When this returns `Ok` the family's resident model is exactly `variant`. A different
    /// resident variant is unloaded first; if that fails the family is left `Unloaded` and the
    /// failure is returned.
    ///
    /// Once the family lock is taken the swap runs on its own task, so dropping this future
    /// does not release the lock before the swap has finished.
    pub async fn ensure(&self, family: Family, variant: &str) -> Result<(), LoadError> {
        let Some(entry) = self.inner.swappable.get(&family) else {
            return self.ensure_preloaded(family, variant);
        };

        let slot = Arc::clone(&entry.slot).lock_owned().await;

        if let Some(resident) = slot.as_ref()
            && resident.variant == variant
        {
            trace!(%family, model = %variant, "Model already resident");
            return Ok(());
        }

        let task = tokio::spawn(swap(
            Arc::clone(&self.inner.backend),
            Arc::clone(&entry.state),
            slot,
            family,
            variant.to_string(),
        ));
        task.await.unwrap_or_else(|e| {
            Err(LoadError::Worker {
                family,
                variant: variant.to_string(),
                reason: e.to_string(),
            })
        })
    }

    fn ensure_preloaded(&self, family: Family, variant: &str) -> Result<(), LoadError> {
        if self
            .inner
            .preloaded
            .contains_key(&(family, variant.to_string()))
        {
            return Ok(());
        }
        Err(LoadError::NotAvailable {
            family,
            variant: variant.to_string(),
            available: self.loaded(family),
        })
    }

    /// Run inference on the resident `variant` of `family`.
    ///
    /// The family lock is held for the whole run, so the handle cannot be unloaded underneath
    /// it.
    pub async fn run(
        &self,
        family: Family,
        variant: &str,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, RunError> {
        let worker_died = |e: tokio::task::JoinError| RunError::Worker {
            family,
            variant: variant.to_string(),
            reason: e.to_string(),
        };
        let backend_failed = |source: BackendError| RunError::Backend {
            family,
            variant: variant.to_string(),
            source,
        };

        let Some(entry) = self.inner.swappable.get(&family) else {
            let handle = self
                .inner
                .preloaded
                .get(&(family, variant.to_string()))
                .map(|h| Arc::clone(h.value()))
                .ok_or_else(|| self.not_resident(family, variant, None))?;
            return tokio::task::spawn_blocking(move || handle.run(&input))
                .await
                .map_err(worker_died)?
                .map_err(backend_failed);
        };

        let slot = Arc::clone(&entry.slot).lock_owned().await;
        match slot.as_ref() {
            Some(resident) if resident.variant == variant => {}
            other => {
                let current = other.map(|r| r.variant.clone());
                return Err(self.not_resident(family, variant, current));
            }
        }

        tokio::task::spawn_blocking(move || match slot.as_ref() {
            Some(resident) => resident.handle.run(&input),
            None => Err(BackendError::Inference("model unloaded during run".to_string())),
        })
        .await
        .map_err(worker_died)?
        .map_err(backend_failed)
    }

    fn not_resident(&self, family: Family, variant: &str, current: Option<String>) -> RunError {
        error!(%family, model = %variant, current = ?current, "run called without a matching ensure");
        RunError::NotResident {
            family,
            variant: variant.to_string(),
            current,
        }
    }

    /// Release every model. Called once at shutdown after the queue has stopped.
    pub async fn unload_all(&self) {
        for (family, entry) in &self.inner.swappable {
            let mut slot = entry.slot.lock().await;
            let Some(resident) = slot.take() else {
                continue;
            };
            let transition =
                Transition::begin(&entry.state, ResidencyState::Unloading(resident.variant.clone()));
            let variant = resident.variant.clone();
            match tokio::task::spawn_blocking(move || resident.handle.unload()).await {
                Ok(Ok(())) => info!(%family, model = %variant, "Model unloaded"),
                Ok(Err(e)) => warn!(%family, model = %variant, error = %e, "Failed to unload model"),
                Err(e) => warn!(%family, model = %variant, error = %e, "Unload worker died"),
            }
            transition.commit(ResidencyState::Unloaded);
        }

        let keys: Vec<(Family, String)> = self
            .inner
            .preloaded
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            let Some((_, handle)) = self.inner.preloaded.remove(&key) else {
                continue;
            };
            // Aliases share a handle; only the last reference unloads it.
            let Ok(handle) = Arc::try_unwrap(handle) else {
                continue;
            };
            let (family, variant) = key;
            match tokio::task::spawn_blocking(move || handle.unload()).await {
                Ok(Ok(())) => info!(%family, model = %variant, "Model unloaded"),
                Ok(Err(e)) => warn!(%family, model = %variant, error = %e, "Failed to unload model"),
                Err(e) => warn!(%family, model = %variant, error = %e, "Unload worker died"),
            }
        }

        let backend = Arc::clone(&self.inner.backend);
        let _ = tokio::task::spawn_blocking(move || backend.reclaim()).await;
    }
}

async fn load_blocking(
    backend: Arc<dyn ModelBackend>,
    family: Family,
    variant: String,
) -> Result<Box<dyn LoadedModel>, LoadError> {
    let owned = variant.clone();
    match tokio::task::spawn_blocking(move || backend.load(family, &owned)).await {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(source)) => Err(LoadError::Backend {
            family,
            variant,
            source,
        }),
        Err(e) => Err(LoadError::Worker {
            family,
            variant,
            reason: e.to_string(),
        }),
    }
}

/// Replace whatever `slot` holds with a freshly loaded `variant`, holding the family lock
/// throughout.
async fn swap(
    backend: Arc<dyn ModelBackend>,
    state: Arc<RwLock<ResidencyState>>,
    mut slot: OwnedMutexGuard<Option<Resident>>,
    family: Family,
    variant: String,
) -> Result<(), LoadError> {
    if let Some(previous) = slot.take() {
        let previous_variant = previous.variant.clone();
        info!(%family, from = %previous_variant, to = %variant, "Swapping model");
        let transition =
            Transition::begin(&state, ResidencyState::Unloading(previous_variant.clone()));

        let reclaim = Arc::clone(&backend);
        let outcome = tokio::task::spawn_blocking(move || {
            let result = previous.handle.unload();
            reclaim.reclaim();
            result
        })
        .await;
        transition.commit(ResidencyState::Unloaded);

        match outcome {
            Ok(Ok(())) => debug!(%family, model = %previous_variant, "Model unloaded"),
            Ok(Err(source)) => {
                error!(%family, model = %previous_variant, error = %source, "Failed to unload model");
                return Err(LoadError::Unload {
                    family,
                    variant: previous_variant,
                    source,
                });
            }
            Err(e) => {
                error!(%family, model = %previous_variant, error = %e, "Unload worker died");
                return Err(LoadError::Worker {
                    family,
                    variant: previous_variant,
                    reason: e.to_string(),
                });
            }
        }
    }

    let transition = Transition::begin(&state, ResidencyState::Loading(variant.clone()));
    info!(%family, model = %variant, "Loading model");
    match load_blocking(backend, family, variant.clone()).await {
        Ok(handle) => {
            info!(%family, model = %variant, "Model is now resident");
            *slot = Some(Resident {
                variant: variant.clone(),
                handle,
            });
            transition.commit(ResidencyState::Resident(variant));
            Ok(())
        }
        Err(e) => {
            error!(%family, model = %variant, error = %e, "Failed to load model");
            transition.commit(ResidencyState::Unloaded);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, EchoBackend};
    use crate::catalog::{BLIP2, FLORENCE2_BASE, FLORENCE2_LARGE, FLUX, REALESRGAN_X2, SDXL};
    use std::time::Duration;

    fn residency() -> (ModelResidency, EchoBackend) {
        let backend = EchoBackend::default();
        (ModelResidency::new(Arc::new(backend.clone())), backend)
    }

    fn index_of(events: &[BackendEvent], wanted: &BackendEvent) -> usize {
        events
            .iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("{wanted:?} not in {events:?}"))
    }

    #[tokio::test]
    async fn test_first_ensure_loads() {
        let (residency, backend) = residency();
        assert_eq!(residency.current(Family::Generation), None);

        residency.ensure(Family::Generation, SDXL).await.unwrap();
        assert_eq!(residency.current(Family::Generation), Some(SDXL.to_string()));

        // Second ensure for the same variant is a no-op
        residency.ensure(Family::Generation, SDXL).await.unwrap();
        let loads = backend
            .events()
            .iter()
            .filter(|e| matches!(e, BackendEvent::Load { .. }))
            .count();
        assert_eq!(loads, 1);
    }

    #[tokio::test]
    async fn test_swap_unloads_before_loading() {
        let (residency, backend) = residency();
        residency.ensure(Family::Generation, SDXL).await.unwrap();
        residency.ensure(Family::Generation, FLUX).await.unwrap();

        let events = backend.events();
        let unload_a = index_of(
            &events,
            &BackendEvent::Unload {
                family: Family::Generation,
                variant: SDXL.to_string(),
            },
        );
        let load_b = index_of(
            &events,
            &BackendEvent::Load {
                family: Family::Generation,
                variant: FLUX.to_string(),
            },
        );
        assert!(unload_a < load_b);
        // Cache reclaimed between the two
        assert!(events[unload_a..load_b].contains(&BackendEvent::Reclaim));
        assert_eq!(residency.current(Family::Generation), Some(FLUX.to_string()));
    }

    #[tokio::test]
    async fn test_run_requires_matching_ensure() {
        let (residency, _backend) = residency();

        let err = residency
            .run(Family::Generation, SDXL, b"prompt".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotResident { current: None, .. }));

        residency.ensure(Family::Generation, FLUX).await.unwrap();
        let err = residency
            .run(Family::Generation, SDXL, b"prompt".to_vec())
            .await
            .unwrap_err();
        match err {
            RunError::NotResident { current, .. } => assert_eq!(current, Some(FLUX.to_string())),
            other => panic!("unexpected error: {other:?}"),
        }

        let output = residency
            .run(Family::Generation, FLUX, b"prompt".to_vec())
            .await
            .unwrap();
        assert_eq!(output, b"prompt");
    }

    #[tokio::test]
    async fn test_inference_failure_is_distinct_from_not_resident() {
        let (residency, backend) = residency();
        backend.fail_run(SDXL);
        residency.ensure(Family::Generation, SDXL).await.unwrap();

        let err = residency
            .run(Family::Generation, SDXL, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Backend {
                source: BackendError::Inference(_),
                ..
            }
        ));
        // Still resident after a failed run
        assert_eq!(residency.current(Family::Generation), Some(SDXL.to_string()));
    }

    #[tokio::test]
    async fn test_load_failure_leaves_family_unloaded() {
        let (residency, backend) = residency();
        backend.fail_load(FLUX);
        residency.ensure(Family::Generation, SDXL).await.unwrap();

        let err = residency.ensure(Family::Generation, FLUX).await.unwrap_err();
        assert!(matches!(err, LoadError::Backend { .. }));
        assert_eq!(residency.state(Family::Generation), ResidencyState::Unloaded);

        // Recovers on the next request
        residency.ensure(Family::Generation, SDXL).await.unwrap();
        assert_eq!(residency.current(Family::Generation), Some(SDXL.to_string()));
    }

    #[tokio::test]
    async fn test_unload_failure_forces_unloaded_and_reports() {
        let (residency, backend) = residency();
        backend.fail_unload(SDXL);
        residency.ensure(Family::Generation, SDXL).await.unwrap();

        let err = residency.ensure(Family::Generation, FLUX).await.unwrap_err();
        match &err {
            LoadError::Unload { variant, .. } => assert_eq!(variant, SDXL),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(residency.state(Family::Generation), ResidencyState::Unloaded);
        assert!(!backend.events().contains(&BackendEvent::Load {
            family: Family::Generation,
            variant: FLUX.to_string(),
        }));

        // Not stuck: the next ensure starts from a cold family
        residency.ensure(Family::Generation, FLUX).await.unwrap();
        assert_eq!(residency.current(Family::Generation), Some(FLUX.to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_ensures_never_overlap_backend_calls() {
        let backend = EchoBackend::default().with_run_delay(Duration::from_millis(5));
        let residency = ModelResidency::new(Arc::new(backend.clone()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let residency = residency.clone();
            let variant = if i % 2 == 0 { SDXL } else { FLUX };
            handles.push(tokio::spawn(async move {
                residency.ensure(Family::Generation, variant).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.max_active(), 1);
        // Loads and unloads alternate: never two variants live at once
        let mut live = 0i32;
        for event in backend.events() {
            match event {
                BackendEvent::Load { .. } => live += 1,
                BackendEvent::Unload { .. } => live -= 1,
                _ => {}
            }
            assert!((0..=1).contains(&live));
        }
    }

    #[tokio::test]
    async fn test_abandoned_ensure_finishes_loading_before_the_next_swap() {
        let backend = EchoBackend::default().with_load_delay(Duration::from_millis(200));
        let residency = ModelResidency::new(Arc::new(backend.clone()));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            residency.ensure(Family::Generation, FLUX),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(
            residency.state(Family::Generation),
            ResidencyState::Loading(FLUX.to_string())
        );

        residency.ensure(Family::Generation, SDXL).await.unwrap();

        assert_eq!(backend.max_active(), 1);
        let events = backend.events();
        let load_flux = index_of(
            &events,
            &BackendEvent::Load {
                family: Family::Generation,
                variant: FLUX.to_string(),
            },
        );
        let unload_flux = index_of(
            &events,
            &BackendEvent::Unload {
                family: Family::Generation,
                variant: FLUX.to_string(),
            },
        );
        let load_sdxl = index_of(
            &events,
            &BackendEvent::Load {
                family: Family::Generation,
                variant: SDXL.to_string(),
            },
        );
        assert!(load_flux < unload_flux && unload_flux < load_sdxl);
        assert_eq!(residency.current(Family::Generation), Some(SDXL.to_string()));
    }

    #[tokio::test]
    async fn test_preloaded_family_membership() {
        let (residency, backend) = residency();
        residency
            .preload(&[
                Preload {
                    family: Family::Caption,
                    variant: FLORENCE2_LARGE.to_string(),
                    serves: vec![FLORENCE2_LARGE.to_string(), FLORENCE2_BASE.to_string()],
                },
                Preload {
                    family: Family::Upscale,
                    variant: REALESRGAN_X2.to_string(),
                    serves: vec![REALESRGAN_X2.to_string()],
                },
            ])
            .await
            .unwrap();

        residency.ensure(Family::Caption, FLORENCE2_BASE).await.unwrap();
        residency.ensure(Family::Caption, FLORENCE2_LARGE).await.unwrap();
        let err = residency.ensure(Family::Caption, BLIP2).await.unwrap_err();
        match err {
            LoadError::NotAvailable { available, .. } => assert_eq!(
                available,
                vec![FLORENCE2_BASE.to_string(), FLORENCE2_LARGE.to_string()]
            ),
            other => panic!("unexpected error: {other:?}"),
        }

        // One backend instance serves both names
        let loads = backend
            .events()
            .iter()
            .filter(|e| matches!(e, BackendEvent::Load { family: Family::Caption, .. }))
            .count();
        assert_eq!(loads, 1);
    }

    #[tokio::test]
    async fn test_preloaded_variants_never_evict_each_other() {
        let (residency, backend) = residency();
        residency
            .preload(&crate::catalog::preload_plan(
                &crate::capabilities::TierTable::default()
                    .capabilities_for(Device::Cuda, 24.0),
            ))
            .await
            .unwrap();

        for variant in [REALESRGAN_X2, crate::catalog::REALESRGAN_X4, REALESRGAN_X2] {
            residency.ensure(Family::Upscale, variant).await.unwrap();
            residency
                .run(Family::Upscale, variant, b"img".to_vec())
                .await
                .unwrap();
        }

        assert!(
            !backend
                .events()
                .iter()
                .any(|e| matches!(e, BackendEvent::Unload { .. }))
        );
        assert_eq!(residency.loaded(Family::Upscale).len(), 2);
    }

    #[tokio::test]
    async fn test_unload_all_releases_shared_handles_once() {
        let (residency, backend) = residency();
        residency
            .preload(&[Preload {
                family: Family::Caption,
                variant: FLORENCE2_LARGE.to_string(),
                serves: vec![FLORENCE2_LARGE.to_string(), FLORENCE2_BASE.to_string()],
            }])
            .await
            .unwrap();
        residency.ensure(Family::Generation, SDXL).await.unwrap();

        residency.unload_all().await;

        let unloads = backend
            .events()
            .iter()
            .filter(|e| matches!(e, BackendEvent::Unload { .. }))
            .count();
        assert_eq!(unloads, 2);
        assert!(residency.resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_resident_models_snapshot() {
        let (residency, _backend) = residency();
        residency
            .preload(&[Preload {
                family: Family::Upscale,
                variant: REALESRGAN_X2.to_string(),
                serves: vec![REALESRGAN_X2.to_string()],
            }])
            .await
            .unwrap();
        residency.ensure(Family::Generation, SDXL).await.unwrap();

        let models = residency.resident_models();
        assert_eq!(
            models,
            vec![
                ResidentModel {
                    family: Family::Generation,
                    variant: SDXL.to_string(),
                    device: Device::Cpu,
                },
                ResidentModel {
                    family: Family::Upscale,
                    variant: REALESRGAN_X2.to_string(),
                    device: Device::Cpu,
                },
            ]
        );
    }
}
