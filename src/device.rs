//! # Device Selection
//!
//! Picks the compute device Whisper runs on. `auto` prefers CUDA, then Metal,
//! then the CPU; an explicit GPU preference falls back to the CPU with a
//! warning when that GPU is missing.

use candle_core::Device;
use tracing::{debug, info, warn};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU, CPU if unavailable
    Cuda,
    /// Metal GPU, CPU if unavailable
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!(
                "Unknown device '{}'. Choose from: auto, cpu, cuda, metal",
                s
            )),
        }
    }
}

/// Resolve a preference to a concrete device.
pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_device().unwrap_or_else(|| {
            warn!("CUDA requested but not available, using CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => metal_device().unwrap_or_else(|| {
            warn!("Metal requested but not available, using CPU");
            Device::Cpu
        }),
        DevicePreference::Auto => {
            if let Some(device) = cuda_device() {
                info!("Selected CUDA GPU for inference");
                device
            } else if let Some(device) = metal_device() {
                info!("Selected Metal GPU for inference");
                device
            } else {
                info!("Using CPU for inference (no GPU acceleration available)");
                Device::Cpu
            }
        }
    }
}

fn cuda_device() -> Option<Device> {
    if !candle_core::utils::cuda_is_available() {
        return None;
    }
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    if !candle_core::utils::metal_is_available() {
        return None;
    }
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

/// Short name reported by `/health`.
pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
        assert_eq!(DevicePreference::default(), DevicePreference::Auto);
    }

    #[test]
    fn test_cpu_preference() {
        let device = select_device(DevicePreference::Cpu);
        assert_eq!(describe(&device), "cpu");
    }

    #[test]
    fn test_auto_always_yields_a_device() {
        let device = select_device(DevicePreference::Auto);
        assert!(["cpu", "cuda", "metal"].contains(&describe(&device)));
    }
}
