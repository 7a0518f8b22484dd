//! Accelerator probing
//!
//! The serving backend owns the device runtime, so accelerator discovery is a
//! trait it implements. `StaticProbe` serves fixed inventories for dry runs
//! and tests.

use std::fmt;
use serde::{Deserialize, Serialize};

use common::models::Device;

/// Runtime an accelerator belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorBackend {
    /// NVIDIA CUDA
    Cuda,
    /// Apple Metal Performance Shaders
    Mps,
}

/// One accelerator as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    /// Index within its runtime
    pub index: usize,
    /// Device name
    pub name: String,
    /// Runtime
    pub backend: AcceleratorBackend,
    /// Total device memory, when the runtime reports it
    pub total_memory_bytes: Option<u64>,
}

impl AcceleratorInfo {
    /// CUDA device with known memory
    pub fn cuda(index: usize, total_memory_bytes: u64) -> Self {
        Self {
            index,
            name: format!("cuda:{}", index),
            backend: AcceleratorBackend::Cuda,
            total_memory_bytes: Some(total_memory_bytes),
        }
    }

    /// Metal device; unified memory is not reported
    pub fn mps() -> Self {
        Self {
            index: 0,
            name: "mps".to_string(),
            backend: AcceleratorBackend::Mps,
            total_memory_bytes: None,
        }
    }

    /// Device this accelerator is addressed as
    pub fn device(&self) -> Device {
        match self.backend {
            AcceleratorBackend::Cuda => Device::Cuda(self.index),
            AcceleratorBackend::Mps => Device::Mps,
        }
    }
}

impl fmt::Display for AcceleratorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total_memory_bytes {
            Some(bytes) => write!(f, "{} ({})", self.name, common::utils::format_bytes(bytes)),
            None => write!(f, "{} (memory unknown)", self.name),
        }
    }
}

/// Source of the accelerator inventory
pub trait AcceleratorProbe {
    /// Accelerators currently visible
    fn accelerators(&self) -> Vec<AcceleratorInfo>;
}

/// Probe for hosts without accelerators
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccelerators;

impl AcceleratorProbe for NoAccelerators {
    fn accelerators(&self) -> Vec<AcceleratorInfo> {
        Vec::new()
    }
}

/// Probe returning a fixed inventory
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    accelerators: Vec<AcceleratorInfo>,
}

impl StaticProbe {
    /// Probe reporting `accelerators`
    pub fn new(accelerators: Vec<AcceleratorInfo>) -> Self {
        Self { accelerators }
    }

    /// `count` identical CUDA devices of `memory_bytes` each
    pub fn uniform_cuda(count: usize, memory_bytes: u64) -> Self {
        Self::new((0..count).map(|i| AcceleratorInfo::cuda(i, memory_bytes)).collect())
    }
}

impl AcceleratorProbe for StaticProbe {
    fn accelerators(&self) -> Vec<AcceleratorInfo> {
        self.accelerators.clone()
    }
}
