//! Hardware capability tiers and admission checks.
//!
//! The capability set is recomputed from the hardware reading on every query, so the probe
//! behind the oracle must be cheap. The server takes one reading at startup with
//! [`crate::hardware::take_reading`] and serves every request from a [`FixedProbe`].
//!
//! [`FixedProbe`]: crate::hardware::FixedProbe
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::catalog::{
    BLIP2, FLORENCE2_BASE, FLORENCE2_LARGE, FLUX, REALESRGAN_X2, REALESRGAN_X4, SDXL,
    upscale_model,
};
pub use crate::hardware::Device;
use crate::hardware::{HardwareProbe, HardwareReading};

/// A single operation the current hardware can perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Capability {
    Upscale { model: String, scale: u8 },
    Image { model: String },
    Caption { model: String },
}

impl Capability {
    pub fn upscale(model: &str, scale: u8) -> Self {
        Capability::Upscale {
            model: model.to_string(),
            scale,
        }
    }

    pub fn image(model: &str) -> Self {
        Capability::Image {
            model: model.to_string(),
        }
    }

    pub fn caption(model: &str) -> Self {
        Capability::Caption {
            model: model.to_string(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Upscale { model, scale } => write!(f, "Upscale {scale}x with {model}"),
            Capability::Image { model } => write!(f, "Image generation with {model}"),
            Capability::Caption { model } => write!(f, "Captioning with {model}"),
        }
    }
}

/// Everything the current hardware tier allows, plus the reading it was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub capabilities: Vec<Capability>,
    pub device: Device,
    pub gpu_memory_gb: f64,
}

impl CapabilitySet {
    pub fn contains(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Models run on the CPU. Everything works, slowly.
    pub fn is_slow(&self) -> bool {
        self.device == Device::Cpu
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{operation} not available. Device: {device}, VRAM: {memory_gb} GB")]
pub struct CapabilityError {
    pub operation: String,
    pub device: Device,
    pub memory_gb: f64,
}

/// A row of the tier table: `capability` is granted once memory reaches `min_memory_gb`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub min_memory_gb: f64,
    pub capability: Capability,
}

impl Tier {
    fn new(min_memory_gb: f64, capability: Capability) -> Self {
        Self {
            min_memory_gb,
            capability,
        }
    }
}

/// Declarative mapping from a hardware reading to capabilities.
///
/// Accelerated tiers are cumulative: a row applies to every memory size at or above its
/// threshold, so a larger card never loses a capability a smaller one had.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    pub cpu: Vec<Capability>,
    pub tiers: Vec<Tier>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            cpu: vec![
                Capability::upscale(REALESRGAN_X2, 2),
                Capability::upscale(REALESRGAN_X4, 4),
                Capability::image(SDXL),
                Capability::caption(BLIP2),
                Capability::caption(FLORENCE2_BASE),
            ],
            tiers: vec![
                Tier::new(4.0, Capability::upscale(REALESRGAN_X2, 2)),
                Tier::new(4.0, Capability::caption(BLIP2)),
                Tier::new(4.0, Capability::caption(FLORENCE2_BASE)),
                Tier::new(6.0, Capability::upscale(REALESRGAN_X4, 4)),
                Tier::new(6.0, Capability::caption(FLORENCE2_LARGE)),
                Tier::new(8.0, Capability::image(SDXL)),
                Tier::new(12.0, Capability::image(FLUX)),
            ],
        }
    }
}

impl TierTable {
    pub fn capabilities_for(&self, device: Device, memory_gb: f64) -> CapabilitySet {
        match device {
            Device::Cpu => CapabilitySet {
                capabilities: self.cpu.clone(),
                device: Device::Cpu,
                gpu_memory_gb: 0.0,
            },
            Device::Cuda => CapabilitySet {
                capabilities: self
                    .tiers
                    .iter()
                    .filter(|tier| memory_gb >= tier.min_memory_gb)
                    .map(|tier| tier.capability.clone())
                    .collect(),
                device: Device::Cuda,
                gpu_memory_gb: (memory_gb * 10.0).round() / 10.0,
            },
        }
    }
}

/// Answers "is this operation allowed on this machine?".
#[derive(Debug, Clone)]
pub struct CapabilityOracle {
    probe: Arc<dyn HardwareProbe>,
    memory_override: Option<f64>,
    table: TierTable,
}

impl CapabilityOracle {
    pub fn new(probe: Arc<dyn HardwareProbe>) -> Self {
        Self {
            probe,
            memory_override: None,
            table: TierTable::default(),
        }
    }

    /// Use a fixed memory size instead of the probed one.
    pub fn with_memory_override(mut self, memory_gb: Option<f64>) -> Self {
        self.memory_override = memory_gb;
        self
    }

    pub fn with_table(mut self, table: TierTable) -> Self {
        self.table = table;
        self
    }

    fn reading(&self) -> HardwareReading {
        match self.probe.probe() {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Accelerator detection failed, falling back to CPU");
                HardwareReading::cpu()
            }
        }
    }

    pub fn detect(&self) -> CapabilitySet {
        let reading = self.reading();
        let memory_gb = self.memory_override.unwrap_or(reading.memory_gb);
        self.table.capabilities_for(reading.device, memory_gb)
    }

    pub fn supports(&self, capability: &Capability) -> bool {
        self.detect().contains(capability)
    }

    pub fn require(&self, capability: &Capability) -> Result<(), CapabilityError> {
        let caps = self.detect();
        if caps.contains(capability) {
            return Ok(());
        }
        Err(CapabilityError {
            operation: capability.to_string(),
            device: caps.device,
            memory_gb: caps.gpu_memory_gb,
        })
    }

    /// Scale 2 always uses the x2 upscaler; anything else is checked against the x4 one.
    pub fn require_upscale(&self, scale: u8) -> Result<(), CapabilityError> {
        let model = upscale_model(scale).unwrap_or(REALESRGAN_X4);
        self.require(&Capability::upscale(model, scale))
    }

    pub fn require_generate(&self, model: &str) -> Result<(), CapabilityError> {
        self.require(&Capability::image(model))
    }

    pub fn require_caption(&self, model: &str) -> Result<(), CapabilityError> {
        self.require(&Capability::caption(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{FixedProbe, ProbeError};
    use rstest::rstest;
    use std::collections::HashSet;

    fn oracle(probe: impl HardwareProbe + 'static) -> CapabilityOracle {
        CapabilityOracle::new(Arc::new(probe))
    }

    #[derive(Debug)]
    struct BrokenProbe;

    impl HardwareProbe for BrokenProbe {
        fn probe(&self) -> Result<HardwareReading, ProbeError> {
            Err(ProbeError::Parse("garbage".to_string()))
        }
    }

    #[test]
    fn test_cpu_gets_fixed_list() {
        let caps = oracle(FixedProbe::cpu()).detect();
        assert_eq!(caps.device, Device::Cpu);
        assert_eq!(caps.gpu_memory_gb, 0.0);
        assert_eq!(caps.capabilities, TierTable::default().cpu);
    }

    #[test]
    fn test_cpu_ignores_memory_override() {
        let caps = oracle(FixedProbe::cpu())
            .with_memory_override(Some(48.0))
            .detect();
        assert_eq!(caps.device, Device::Cpu);
        assert!(!caps.contains(&Capability::image(FLUX)));
    }

    #[test]
    fn test_ten_gigabytes() {
        let caps = oracle(FixedProbe::cuda(10.0)).detect();
        assert_eq!(caps.device, Device::Cuda);
        assert!(caps.contains(&Capability::upscale(REALESRGAN_X2, 2)));
        assert!(caps.contains(&Capability::upscale(REALESRGAN_X4, 4)));
        assert!(caps.contains(&Capability::caption(FLORENCE2_BASE)));
        assert!(caps.contains(&Capability::caption(FLORENCE2_LARGE)));
        assert!(caps.contains(&Capability::image(SDXL)));
        assert!(!caps.contains(&Capability::image(FLUX)));
    }

    #[test]
    fn test_memory_override_replaces_probe() {
        let oracle = oracle(FixedProbe::cuda(4.0)).with_memory_override(Some(16.0));
        let caps = oracle.detect();
        assert_eq!(caps.gpu_memory_gb, 16.0);
        assert!(caps.contains(&Capability::image(FLUX)));
    }

    #[test]
    fn test_memory_is_rounded() {
        let caps = oracle(FixedProbe::cuda(23.6789)).detect();
        assert_eq!(caps.gpu_memory_gb, 23.7);
    }

    #[test]
    fn test_probe_failure_degrades_to_cpu() {
        let caps = oracle(BrokenProbe).detect();
        assert_eq!(caps.device, Device::Cpu);
        assert_eq!(caps.capabilities, TierTable::default().cpu);
    }

    #[derive(Debug, Default)]
    struct CountingProbe(std::sync::atomic::AtomicUsize);

    impl HardwareProbe for CountingProbe {
        fn probe(&self) -> Result<HardwareReading, ProbeError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(ProbeError::Failed {
                command: "nvidia-smi".to_string(),
                status: "exit status: 9".to_string(),
                stderr: "driver mismatch".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_requests_reuse_the_startup_reading() {
        let probe = Arc::new(CountingProbe::default());
        let reading =
            crate::hardware::take_reading(probe.clone(), std::time::Duration::from_secs(5)).await;
        let oracle = oracle(FixedProbe(reading));

        for _ in 0..3 {
            assert!(oracle.require_generate(SDXL).is_ok());
        }
        assert!(oracle.detect().is_slow());
        assert_eq!(probe.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_cpu_is_slow() {
        assert!(oracle(FixedProbe::cpu()).detect().is_slow());
        assert!(!oracle(FixedProbe::cuda(4.0)).detect().is_slow());
    }

    #[rstest]
    #[case(0.0, 4.0)]
    #[case(4.0, 6.0)]
    #[case(5.9, 8.0)]
    #[case(8.0, 12.0)]
    #[case(11.99, 80.0)]
    #[case(2.0, 2.5)]
    fn test_tiers_are_monotonic(#[case] lower: f64, #[case] higher: f64) {
        let table = TierTable::default();
        let low: HashSet<_> = table
            .capabilities_for(Device::Cuda, lower)
            .capabilities
            .into_iter()
            .collect();
        let high: HashSet<_> = table
            .capabilities_for(Device::Cuda, higher)
            .capabilities
            .into_iter()
            .collect();
        assert!(low.is_subset(&high), "{low:?} not within {high:?}");
    }

    #[test]
    fn test_supports_requires_exact_match() {
        let oracle = oracle(FixedProbe::cuda(24.0));
        assert!(oracle.supports(&Capability::upscale(REALESRGAN_X4, 4)));
        assert!(!oracle.supports(&Capability::upscale(REALESRGAN_X4, 2)));
        assert!(!oracle.supports(&Capability::image("dall-e")));
    }

    #[test]
    fn test_require_error_names_operation_and_hardware() {
        let err = oracle(FixedProbe::cuda(6.0))
            .require_generate(SDXL)
            .unwrap_err();
        assert_eq!(err.device, Device::Cuda);
        assert_eq!(err.memory_gb, 6.0);
        assert_eq!(
            err.to_string(),
            "Image generation with sdxl not available. Device: cuda, VRAM: 6 GB"
        );
    }

    #[test]
    fn test_require_upscale_maps_scale_to_model() {
        let oracle = oracle(FixedProbe::cuda(4.0));
        assert!(oracle.require_upscale(2).is_ok());
        let err = oracle.require_upscale(4).unwrap_err();
        assert!(err.operation.contains(REALESRGAN_X4));
        assert!(oracle.require_caption(BLIP2).is_ok());
        assert!(oracle.require_caption(FLORENCE2_LARGE).is_err());
    }

    #[test]
    fn test_capability_serializes_with_kind_tag() {
        let json = serde_json::to_value(Capability::upscale(REALESRGAN_X2, 2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "upscale", "model": "realesrgan-x2plus", "scale": 2})
        );
        let json = serde_json::to_value(Capability::image(SDXL)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "image", "model": "sdxl"}));
    }
}
