//! # Compute Devices
//!
//! Parses the configured device list (`"cpu"`, `"cuda:0"`, `"metal"`, `"auto"`)
//! and turns entries into candle devices when a model slot loads.
//!
//! Each entry in the list becomes one model slot in the registry, so listing the
//! same GPU twice means two model instances share that GPU.

use candle_core::Device;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// A compute device a model instance can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "ordinal")]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    /// Open the candle device. Fails if the backend is missing or the ordinal does not exist.
    pub fn to_candle(&self) -> anyhow::Result<Device> {
        let device = match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(*ordinal)?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(*ordinal)?,
        };
        Ok(device)
    }

    /// Best device on this machine: CUDA 0, then Metal 0, then CPU.
    pub fn detect() -> Self {
        if Self::is_available(&DeviceSpec::Cuda(0)) {
            info!("Selected CUDA GPU for ML inference");
            DeviceSpec::Cuda(0)
        } else if Self::is_available(&DeviceSpec::Metal(0)) {
            info!("Selected Metal GPU for ML inference");
            DeviceSpec::Metal(0)
        } else {
            info!("Using CPU for ML inference (no GPU acceleration available)");
            DeviceSpec::Cpu
        }
    }

    pub fn is_available(&self) -> bool {
        match self.to_candle() {
            Ok(_) => true,
            Err(e) => {
                debug!(device = %self, "Device not available: {}", e);
                false
            }
        }
    }

    /// Parse one configured entry, resolving `auto` against the current machine.
    pub fn resolve(entry: &str) -> Result<Self, String> {
        match entry.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(Self::detect()),
            _ => entry.parse(),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let (kind, ordinal) = match lowered.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid device ordinal in '{}'", s))?;
                (kind.to_string(), ordinal)
            }
            None => (lowered.clone(), 0),
        };
        match kind.as_str() {
            "cpu" if !lowered.contains(':') => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(format!("Unknown device: {}", s)),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => write!(f, "cpu"),
            DeviceSpec::Cuda(n) => write!(f, "cuda:{}", n),
            DeviceSpec::Metal(n) => write!(f, "metal:{}", n),
        }
    }
}

/// Device availability summary for the health and config endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub cuda_available: bool,
    pub metal_available: bool,
    pub gpu_available: bool,
    pub configured: Vec<String>,
}

impl DeviceSummary {
    pub fn detect(configured: &[DeviceSpec]) -> Self {
        let cuda_available = DeviceSpec::Cuda(0).is_available();
        let metal_available = DeviceSpec::Metal(0).is_available();
        Self {
            cuda_available,
            metal_available,
            gpu_available: cuda_available || metal_available,
            configured: configured.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("CUDA".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(0));
        assert_eq!("cuda:1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(1));
        assert_eq!("gpu:2".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(2));
        assert_eq!("metal".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(0));
        assert!("cpu:1".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
        assert!("tpu".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for spec in [DeviceSpec::Cpu, DeviceSpec::Cuda(3), DeviceSpec::Metal(0)] {
            assert_eq!(spec.to_string().parse::<DeviceSpec>().unwrap(), spec);
        }
    }

    #[test]
    fn test_cpu_always_available() {
        assert!(DeviceSpec::Cpu.is_available());
        assert!(matches!(DeviceSpec::Cpu.to_candle().unwrap(), Device::Cpu));
    }

    #[test]
    fn test_resolve_auto() {
        let resolved = DeviceSpec::resolve("auto").unwrap();
        assert!(resolved.is_available());
    }
}
