// Device selection for training and inference

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Requested execution device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Auto-detect best available device
    #[default]
    Auto,
    /// CPU (slow, works everywhere)
    Cpu,
    /// NVIDIA CUDA GPU (requires the `cuda` feature)
    Cuda,
    /// Apple Metal GPU (requires the `metal` feature)
    Metal,
}

impl DevicePreference {
    /// Get short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            DevicePreference::Auto => "Auto",
            DevicePreference::Cpu => "CPU",
            DevicePreference::Cuda => "CUDA (GPU)",
            DevicePreference::Metal => "Metal (GPU)",
        }
    }

    /// Check if this device is usable in the current build and machine
    pub fn is_available(&self) -> bool {
        match self {
            DevicePreference::Auto | DevicePreference::Cpu => true,
            DevicePreference::Cuda => candle_core::utils::cuda_is_available(),
            DevicePreference::Metal => candle_core::utils::metal_is_available(),
        }
    }

    /// Resolve Auto to a concrete preference
    pub fn effective(&self) -> DevicePreference {
        match self {
            DevicePreference::Auto => {
                if DevicePreference::Cuda.is_available() {
                    DevicePreference::Cuda
                } else if DevicePreference::Metal.is_available() {
                    DevicePreference::Metal
                } else {
                    DevicePreference::Cpu
                }
            }
            other => *other,
        }
    }

    /// Open the candle device for this preference
    pub fn device(&self) -> Result<Device> {
        let device = match self.effective() {
            DevicePreference::Cuda => {
                Device::new_cuda(0).context("Failed to open CUDA device 0")?
            }
            DevicePreference::Metal => {
                Device::new_metal(0).context("Failed to open Metal device 0")?
            }
            _ => Device::Cpu,
        };
        tracing::debug!(requested = self.name(), "Selected device {:?}", device);
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_available() {
        assert!(DevicePreference::Cpu.is_available());
        assert!(DevicePreference::Cpu.device().unwrap().is_cpu());
    }

    #[test]
    fn test_auto_resolves_to_concrete_device() {
        assert_ne!(DevicePreference::Auto.effective(), DevicePreference::Auto);
    }

    #[test]
    fn test_parses_lowercase_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            device: DevicePreference,
        }
        let parsed: Wrapper = toml::from_str("device = \"metal\"").unwrap();
        assert_eq!(parsed.device, DevicePreference::Metal);
    }
}
