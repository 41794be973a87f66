//! Model backends: the code that actually owns accelerator memory.
//!
//! This module defines the trait that abstracts the underlying inference runtime. The
//! residency manager decides *when* models are loaded and unloaded; a backend decides *how*.
//!
//! ## Blocking contract
//!
//! Every method here may block for seconds or minutes (weight loading, diffusion steps). They
//! are always called from the blocking thread pool, never from an async context, so
//! implementations are free to do synchronous I/O and compute.
//!
//! ## Implementations
//!
//! - [`ProcessBackend`]: hosts each model in a worker subprocess speaking a framed protocol
//! - [`EchoBackend`]: in-process, returns its input; records every call for inspection
use std::fmt;
use thiserror::Error;

use crate::catalog::Family;
use crate::hardware::Device;

mod echo;
pub mod process;

pub use echo::{BackendEvent, EchoBackend};
pub use process::ProcessBackend;

/// Errors reported by a backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend does not know this variant
    #[error("unknown {family} model: {variant}")]
    UnknownVariant { family: Family, variant: String },

    /// Loading weights or starting the model host failed
    #[error("load failed: {0}")]
    Load(String),

    /// Releasing the model failed
    #[error("unload failed: {0}")]
    Unload(String),

    /// Inference failed
    #[error("inference failed: {0}")]
    Inference(String),

    /// Communication with the model host failed
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

/// A model that has been loaded onto the accelerator.
///
/// Dropping a `LoadedModel` without calling [`LoadedModel::unload`] is allowed but gives the
/// implementation no way to report teardown failures.
pub trait LoadedModel: Send + Sync {
    /// Run inference. Input and output are opaque encoded buffers (images, JSON, text).
    fn run(&self, input: &[u8]) -> Result<Vec<u8>, BackendError>;

    /// Release the model and its accelerator memory.
    fn unload(self: Box<Self>) -> Result<(), BackendError>;
}

/// Factory for loaded models.
///
/// # Implementation Notes
///
/// - `load` for one family is never called while another variant of the same swappable family
///   is loaded
/// - `reclaim` is called after every queued task and after every unload; it should release
///   transient allocator caches but must not touch loaded weights
pub trait ModelBackend: Send + Sync + fmt::Debug {
    /// Device the backend places models on.
    fn device(&self) -> Device;

    /// Load `variant` of `family` onto the accelerator.
    ///
    /// # Errors
    /// * `BackendError::UnknownVariant` - the backend cannot serve this variant
    /// * `BackendError::Load` - loading failed
    fn load(&self, family: Family, variant: &str) -> Result<Box<dyn LoadedModel>, BackendError>;

    /// Release transient accelerator caches.
    ///
    /// Default implementation does nothing.
    fn reclaim(&self) {}
}
