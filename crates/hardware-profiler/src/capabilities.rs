//! Hardware capabilities snapshot

use serde::{Deserialize, Serialize};
use sysinfo::{System, SystemExt};
use tracing::{debug, info};

use common::models::Device;

use crate::probe::{AcceleratorBackend, AcceleratorInfo, AcceleratorProbe};

/// Hardware visible to the loader at the time of a reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    /// Logical CPU cores
    pub logical_cores: usize,
    /// Physical CPU cores
    pub physical_cores: usize,
    /// Total system memory in bytes
    pub system_memory_bytes: u64,
    /// Accelerators reported by the backend
    pub accelerators: Vec<AcceleratorInfo>,
}

impl HardwareCapabilities {
    /// Detects the host and asks `probe` for accelerators
    pub fn detect(probe: &dyn AcceleratorProbe) -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let capabilities = Self {
            logical_cores: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
            system_memory_bytes: system.total_memory(),
            accelerators: probe.accelerators(),
        };

        info!(
            cores = capabilities.logical_cores,
            memory = %common::utils::format_bytes(capabilities.system_memory_bytes),
            accelerators = capabilities.accelerators.len(),
            "Hardware detected"
        );
        for accelerator in &capabilities.accelerators {
            debug!("Accelerator: {}", accelerator);
        }

        capabilities
    }

    /// Snapshot with a fixed accelerator list and no host probing
    pub fn with_accelerators(accelerators: Vec<AcceleratorInfo>) -> Self {
        Self {
            logical_cores: 1,
            physical_cores: 1,
            system_memory_bytes: 0,
            accelerators,
        }
    }

    /// CUDA accelerators in index order
    pub fn cuda_devices(&self) -> Vec<&AcceleratorInfo> {
        let mut devices: Vec<_> = self
            .accelerators
            .iter()
            .filter(|a| a.backend == AcceleratorBackend::Cuda)
            .collect();
        devices.sort_by_key(|a| a.index);
        devices
    }

    /// Number of CUDA accelerators
    pub fn cuda_count(&self) -> usize {
        self.cuda_devices().len()
    }

    /// Returns true if a Metal device is present
    pub fn has_mps(&self) -> bool {
        self.accelerators
            .iter()
            .any(|a| a.backend == AcceleratorBackend::Mps)
    }

    /// Returns true if any accelerator is present
    pub fn has_accelerator(&self) -> bool {
        !self.accelerators.is_empty()
    }

    /// Total memory of the first CUDA device, if known
    pub fn primary_accelerator_memory(&self) -> Option<u64> {
        self.cuda_devices()
            .first()
            .and_then(|a| a.total_memory_bytes)
    }

    /// Preferred single device: CUDA 0, then MPS, then CPU
    pub fn preferred_device(&self) -> Device {
        if self.cuda_count() > 0 {
            Device::Cuda(0)
        } else if self.has_mps() {
            Device::Mps
        } else {
            Device::Cpu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{NoAccelerators, StaticProbe};
    use common::utils::GIB;

    #[test]
    fn test_detect_without_accelerators() {
        let capabilities = HardwareCapabilities::detect(&NoAccelerators);
        assert!(capabilities.logical_cores >= 1);
        assert!(!capabilities.has_accelerator());
        assert_eq!(capabilities.preferred_device(), Device::Cpu);
    }

    #[test]
    fn test_cuda_queries() {
        let probe = StaticProbe::new(vec![
            AcceleratorInfo::cuda(1, 16 * GIB),
            AcceleratorInfo::cuda(0, 8 * GIB),
        ]);
        let capabilities = HardwareCapabilities::detect(&probe);
        assert_eq!(capabilities.cuda_count(), 2);
        assert_eq!(capabilities.primary_accelerator_memory(), Some(8 * GIB));
        assert_eq!(capabilities.preferred_device(), Device::Cuda(0));
    }

    #[test]
    fn test_mps_only() {
        let capabilities = HardwareCapabilities::with_accelerators(vec![AcceleratorInfo::mps()]);
        assert!(capabilities.has_accelerator());
        assert_eq!(capabilities.cuda_count(), 0);
        assert_eq!(capabilities.primary_accelerator_memory(), None);
        assert_eq!(capabilities.preferred_device(), Device::Mps);
    }
}
