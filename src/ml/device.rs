// ============================================================
// Layer 5 — Device, Precision and Backends
// ============================================================
// Maps the config's device string onto a burn backend:
//
//   "cpu"                       → Autodiff<NdArray>
//   "cuda[:N]" "gpu[:N]"
//   "wgpu[:N]" "mps"            → Autodiff<Wgpu>
//
// Batches for an accelerator are uploaded on a background
// thread (see domain::transfer); on the CPU the upload is a
// plain copy and completes synchronously.
//
// Reference: Burn Book §3 (Backends)

use burn::backend::{wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};
use serde::{Deserialize, Serialize};

use crate::domain::error::{TrainError, TrainResult};

// ─── Precision ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Bf16,
    Fp16,
}

impl Precision {
    pub fn parse(s: &str) -> TrainResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "float32" => Ok(Precision::Fp32),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "fp16" | "float16" => Ok(Precision::Fp16),
            other => Err(TrainError::config(format!(
                "unknown dtype '{other}' (expected fp32, bf16 or fp16)"
            ))),
        }
    }

    /// Only fp16 has a narrow enough exponent to need loss scaling
    pub fn needs_loss_scaling(&self) -> bool {
        matches!(self, Precision::Fp16)
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Precision::Fp32 => "fp32",
            Precision::Bf16 => "bf16",
            Precision::Fp16 => "fp16",
        })
    }
}

// ─── Device ───────────────────────────────────────────────────────────────────
/// Autodiff backend used for "cpu" runs
pub type CpuBackend = Autodiff<NdArray>;

/// Autodiff backend used for accelerator runs
pub type GpuBackend = Autodiff<Wgpu>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    /// Adapter index, or the system default when absent
    Gpu(Option<usize>),
}

impl Device {
    pub fn parse(s: &str) -> TrainResult<Self> {
        let lower = s.to_ascii_lowercase();
        if lower == "cpu" {
            return Ok(Device::Cpu);
        }
        if lower == "mps" {
            return Ok(Device::Gpu(None));
        }

        let (kind, index) = match lower.split_once(':') {
            Some((kind, index)) => (kind, Some(index)),
            None => (lower.as_str(), None),
        };
        if !matches!(kind, "cuda" | "gpu" | "wgpu") {
            return Err(TrainError::config(format!("unknown device '{s}'")));
        }
        match index {
            None => Ok(Device::Gpu(None)),
            Some(i) => i
                .parse::<usize>()
                .map(|i| Device::Gpu(Some(i)))
                .map_err(|_| TrainError::config(format!("bad device index in '{s}'"))),
        }
    }

    /// Accelerators get asynchronous batch uploads
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    pub fn wgpu_device(&self) -> WgpuDevice {
        match self {
            Device::Gpu(Some(i)) => WgpuDevice::DiscreteGpu(*i),
            Device::Gpu(None) => WgpuDevice::default(),
            Device::Cpu => WgpuDevice::Cpu,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(Some(i)) => write!(f, "gpu:{i}"),
            Device::Gpu(None) => f.write_str("gpu"),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precision() {
        assert_eq!(Precision::parse("fp16").unwrap(), Precision::Fp16);
        assert_eq!(Precision::parse("bfloat16").unwrap(), Precision::Bf16);
        assert!(Precision::parse("int8").is_err());
        assert!(Precision::Fp16.needs_loss_scaling());
        assert!(!Precision::Bf16.needs_loss_scaling());
    }

    #[test]
    fn test_parse_device() {
        assert_eq!(Device::parse("cpu").unwrap(), Device::Cpu);
        assert_eq!(Device::parse("CUDA").unwrap(), Device::Gpu(None));
        assert_eq!(Device::parse("cuda:1").unwrap(), Device::Gpu(Some(1)));
        assert_eq!(Device::parse("wgpu:0").unwrap(), Device::Gpu(Some(0)));
        assert_eq!(Device::parse("mps").unwrap(), Device::Gpu(None));

        let err = Device::parse("cuda:x").unwrap_err();
        assert!(err.is_fatal_config());
        assert!(err.to_string().contains("cuda:x"));
        assert!(Device::parse("tpu").is_err());
    }

    #[test]
    fn test_only_accelerators_transfer_asynchronously() {
        assert!(!Device::Cpu.is_accelerator());
        assert!(Device::Gpu(Some(0)).is_accelerator());
        assert_eq!(Device::Gpu(Some(2)).to_string(), "gpu:2");
    }
}
