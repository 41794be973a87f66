//! Accelerator detection.
//!
//! Probes answer two questions: which device the models will run on, and how much accelerator
//! memory it has. The capability oracle turns the reading into a tier.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observation of the accelerator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareReading {
    pub device: Device,
    /// Total accelerator memory in GiB. Zero on CPU.
    pub memory_gb: f64,
}

impl HardwareReading {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            memory_gb: 0.0,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("could not parse accelerator memory from {0:?}")]
    Parse(String),
}

pub trait HardwareProbe: Send + Sync + fmt::Debug {
    fn probe(&self) -> Result<HardwareReading, ProbeError>;
}

/// A probe that always returns the same reading. Used for `--device cpu` and in tests.
#[derive(Debug, Clone)]
pub struct FixedProbe(pub HardwareReading);

impl FixedProbe {
    pub fn cuda(memory_gb: f64) -> Self {
        Self(HardwareReading {
            device: Device::Cuda,
            memory_gb,
        })
    }

    pub fn cpu() -> Self {
        Self(HardwareReading::cpu())
    }
}

impl HardwareProbe for FixedProbe {
    fn probe(&self) -> Result<HardwareReading, ProbeError> {
        Ok(self.0)
    }
}

/// Reads total memory of the first GPU from `nvidia-smi`.
///
/// The command runs at most once per probe instance. Its outcome, success or failure, is
/// reused for every later call.
#[derive(Debug)]
pub struct NvidiaSmiProbe {
    command: String,
    reading: OnceLock<Result<HardwareReading, ProbeError>>,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl NvidiaSmiProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reading: OnceLock::new(),
        }
    }

    fn query(&self) -> Result<HardwareReading, ProbeError> {
        let output = Command::new(&self.command)
            .args([
                "--query-gpu=memory.total",
                "--format=csv,noheader,nounits",
                "-i",
                "0",
            ])
            .output()
            .map_err(|e| ProbeError::Spawn {
                command: self.command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                command: self.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let memory_gb = parse_memory_mib(&stdout)? / 1024.0;
        debug!(memory_gb, "nvidia-smi reported accelerator memory");

        Ok(HardwareReading {
            device: Device::Cuda,
            memory_gb,
        })
    }
}

impl HardwareProbe for NvidiaSmiProbe {
    fn probe(&self) -> Result<HardwareReading, ProbeError> {
        self.reading.get_or_init(|| self.query()).clone()
    }
}

/// Take a single reading off the async runtime.
///
/// A probe that fails or does not answer within `timeout` yields the CPU reading. The result
/// is meant to be wrapped in a [`FixedProbe`] so that nothing on the request path ever runs
/// the probe again.
pub async fn take_reading(probe: Arc<dyn HardwareProbe>, timeout: Duration) -> HardwareReading {
    let reading = tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || probe.probe()));
    match reading.await {
        Ok(Ok(Ok(reading))) => reading,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Accelerator detection failed, falling back to CPU");
            HardwareReading::cpu()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Accelerator detection panicked, falling back to CPU");
            HardwareReading::cpu()
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "Accelerator detection timed out, falling back to CPU");
            HardwareReading::cpu()
        }
    }
}

/// Parse the first line of `nvidia-smi` csv output (MiB, no units).
fn parse_memory_mib(stdout: &str) -> Result<f64, ProbeError> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|mib| mib.is_finite() && *mib >= 0.0)
        .ok_or_else(|| ProbeError::Parse(stdout.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_mib() {
        assert_eq!(parse_memory_mib("24576\n").unwrap(), 24576.0);
        assert_eq!(parse_memory_mib("\n 8192 \n16384\n").unwrap(), 8192.0);
        assert!(matches!(parse_memory_mib(""), Err(ProbeError::Parse(_))));
        assert!(matches!(
            parse_memory_mib("[N/A]"),
            Err(ProbeError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let probe = NvidiaSmiProbe::new("definitely-not-a-real-nvidia-smi");
        assert!(matches!(probe.probe(), Err(ProbeError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_query_is_not_repeated() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("gpu-serve-smi-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let calls = dir.join("calls");
        let script = dir.join("nvidia-smi");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho call >> '{}'\nexit 9\n", calls.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = NvidiaSmiProbe::new(script.to_string_lossy());
        for _ in 0..3 {
            assert!(matches!(probe.probe(), Err(ProbeError::Failed { .. })));
        }
        let invocations = std::fs::read_to_string(&calls).unwrap().lines().count();
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(invocations, 1);
    }

    #[derive(Debug)]
    struct HungProbe;

    impl HardwareProbe for HungProbe {
        fn probe(&self) -> Result<HardwareReading, ProbeError> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(HardwareReading {
                device: Device::Cuda,
                memory_gb: 24.0,
            })
        }
    }

    #[tokio::test]
    async fn test_take_reading_gives_up_on_a_hung_probe() {
        let started = std::time::Instant::now();
        let reading = take_reading(Arc::new(HungProbe), Duration::from_millis(50)).await;
        assert_eq!(reading, HardwareReading::cpu());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_take_reading_falls_back_to_cpu() {
        let probe = Arc::new(NvidiaSmiProbe::new("definitely-not-a-real-nvidia-smi"));
        let reading = take_reading(probe, Duration::from_secs(5)).await;
        assert_eq!(reading, HardwareReading::cpu());

        let reading = take_reading(Arc::new(FixedProbe::cuda(12.0)), Duration::from_secs(5)).await;
        assert_eq!(reading.memory_gb, 12.0);
    }

    #[test]
    fn test_fixed_probe() {
        assert_eq!(FixedProbe::cpu().probe().unwrap(), HardwareReading::cpu());
        let reading = FixedProbe::cuda(12.0).probe().unwrap();
        assert_eq!(reading.device, Device::Cuda);
        assert_eq!(reading.memory_gb, 12.0);
    }
}
