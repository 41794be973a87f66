//! Configuration parsing and validation for the server
//!
//! Command-line arguments with environment fallbacks, parsed with clap.
use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use gpu_serve::hardware::{FixedProbe, HardwareProbe, NvidiaSmiProbe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceChoice {
    /// Use CUDA when nvidia-smi reports a GPU, otherwise CPU.
    Auto,
    Cuda,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Host every model in a worker subprocess.
    Process,
    /// In-process backend that echoes inputs back. Needs no accelerator.
    Echo,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the API server will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "gpu_serve")]
    pub metrics_prefix: String,

    /// Accelerator memory in GB, replacing auto-detection.
    #[arg(long, env = "GPU_MEMORY_GB")]
    pub gpu_memory_gb: Option<f64>,

    #[arg(long, env = "GPU_SERVE_DEVICE", value_enum, default_value_t = DeviceChoice::Auto)]
    pub device: DeviceChoice,

    #[arg(long, value_enum, default_value_t = BackendKind::Process)]
    pub backend: BackendKind,

    /// Executable that hosts a single model. See the process backend for the protocol.
    #[arg(long, default_value = "gpu-serve-worker")]
    pub worker_command: String,

    /// Where model weights are cached. A leading `~/` expands to the home directory.
    #[arg(long, default_value = "~/.cache/ai3/models")]
    pub models_dir: PathBuf,

    /// How long a request waits for its GPU task before giving up.
    #[arg(long, default_value_t = 600)]
    pub request_timeout_secs: u64,

    /// API keys accepted as bearer tokens. No keys disables authentication.
    #[arg(long = "api-key", env = "GPU_SERVE_API_KEYS", value_delimiter = ',')]
    pub api_keys: Vec<String>,

    /// Debug logging for this crate and the HTTP layer.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("--request-timeout-secs must be greater than zero"));
        }
        if let Some(memory) = self.gpu_memory_gb
            && !(memory.is_finite() && memory >= 0.0)
        {
            return Err(anyhow!(
                "--gpu-memory-gb must be a non-negative number, got {memory}"
            ));
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn models_dir(&self) -> PathBuf {
        match (
            self.models_dir.strip_prefix("~"),
            std::env::var_os("HOME"),
        ) {
            (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
            _ => self.models_dir.clone(),
        }
    }

    /// The hardware probe implied by `--device` and `--gpu-memory-gb`.
    pub fn probe(&self) -> Arc<dyn HardwareProbe> {
        match (self.device, self.gpu_memory_gb) {
            (DeviceChoice::Cpu, _) => Arc::new(FixedProbe::cpu()),
            (DeviceChoice::Cuda, Some(memory)) => Arc::new(FixedProbe::cuda(memory)),
            (DeviceChoice::Cuda | DeviceChoice::Auto, _) => Arc::new(NvidiaSmiProbe::default()),
        }
    }

    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "gpu_serve=debug,tower_http=debug"
        } else {
            "info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_serve::hardware::Device;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("gpu-serve").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.device, DeviceChoice::Auto);
        assert_eq!(config.backend, BackendKind::Process);
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
        assert!(config.api_keys.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_keys_split_on_comma() {
        let config = parse(&["--api-key", "sk-a,sk-b", "--api-key", "sk-c"]);
        assert_eq!(config.api_keys, vec!["sk-a", "sk-b", "sk-c"]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--request-timeout-secs", "0"]).validate().is_err());
        assert!(parse(&["--gpu-memory-gb=-1"]).validate().is_err());
        assert!(parse(&["--gpu-memory-gb", "12.5"]).validate().is_ok());
    }

    #[test]
    fn test_probe_follows_device_choice() {
        let cpu = parse(&["--device", "cpu", "--gpu-memory-gb", "24"]).probe();
        assert_eq!(cpu.probe().unwrap().device, Device::Cpu);

        let cuda = parse(&["--device", "cuda", "--gpu-memory-gb", "24"]).probe();
        let reading = cuda.probe().unwrap();
        assert_eq!(reading.device, Device::Cuda);
        assert_eq!(reading.memory_gb, 24.0);
    }

    #[test]
    fn test_absolute_models_dir_is_kept() {
        let config = parse(&["--models-dir", "/srv/models"]);
        assert_eq!(config.models_dir(), PathBuf::from("/srv/models"));
    }
}
