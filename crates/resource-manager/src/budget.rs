//! Memory budget estimation
//!
//! Proposes a per-device memory cap below the device total so that runtime
//! fragmentation does not push a load out of memory. Budgets are expressed in
//! whole GiB, the same unit bare user overrides are read in.

use std::collections::BTreeMap;
use tracing::{info, warn};

use common::error::Result;
use common::models::{MaxMemory, MemoryLimit};
use common::utils::MIB;
use hardware_profiler::HardwareCapabilities;

/// Host memory cap used when none is configured
pub const DEFAULT_CPU_MEMORY_GIB: u64 = 99;

/// Memory budget estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudgetEstimator {
    /// Size of one coarse unit in MiB
    pub unit_mib: u64,
    /// Headroom reserved below the device total, in MiB
    pub headroom_mib: u64,
    /// Smallest remainder tolerated between total and suggestion, in MiB
    pub min_remainder_mib: u64,
}

impl Default for MemoryBudgetEstimator {
    fn default() -> Self {
        Self {
            unit_mib: 1000,
            headroom_mib: 1000,
            min_remainder_mib: 800,
        }
    }
}

impl MemoryBudgetEstimator {
    /// Suggested budget in coarse units for a device of `total_mib` MiB
    pub fn estimate_units(&self, total_mib: u64) -> u64 {
        let unit = self.unit_mib as f64;
        let total = total_mib as f64;

        let mut suggestion = ((total - self.headroom_mib as f64) / unit).round() * unit;
        if total - suggestion < self.min_remainder_mib as f64 {
            suggestion -= unit;
        }

        (suggestion / unit).round().max(0.0) as u64
    }

    /// Suggested cap for a device reporting `device_total_bytes`
    pub fn estimate(&self, device_total_bytes: u64) -> MemoryLimit {
        MemoryLimit::gib(self.estimate_units(device_total_bytes / MIB))
    }
}

/// Builds the per-device cap map for a load.
///
/// Explicit overrides always win and are used verbatim. Otherwise, with
/// `auto_devices`, the first accelerator's total memory feeds the estimator.
/// Returns `None` when no cap can be resolved.
pub fn resolve_max_memory(
    explicit: &[MemoryLimit],
    cpu: Option<&MemoryLimit>,
    auto_devices: bool,
    hardware: &HardwareCapabilities,
) -> Result<Option<MaxMemory>> {
    let cpu = cpu
        .cloned()
        .unwrap_or_else(|| MemoryLimit::gib(DEFAULT_CPU_MEMORY_GIB));

    if !explicit.is_empty() {
        let devices: BTreeMap<usize, MemoryLimit> =
            explicit.iter().cloned().enumerate().collect();
        return Ok(Some(MaxMemory { devices, cpu }));
    }

    if !auto_devices {
        return Ok(None);
    }

    let Some(total) = hardware.primary_accelerator_memory() else {
        warn!("Accelerator memory is unknown, no memory cap can be estimated");
        return Ok(None);
    };

    let suggestion = MemoryBudgetEstimator::default().estimate(total);
    if suggestion.bytes() == 0 {
        warn!(
            "Device memory {} is below the reserved headroom",
            common::utils::format_bytes(total)
        );
    }
    info!(
        "Auto-assigning gpu memory {} for device 0 to prevent out-of-memory errors; set gpu_memory to override",
        suggestion
    );

    Ok(Some(MaxMemory {
        devices: BTreeMap::from([(0, suggestion)]),
        cpu,
    }))
}
