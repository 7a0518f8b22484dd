//! Precision and quantization selection
//!
//! This module turns the load flags and the detected hardware into a
//! [`LoadPlan`]. Rows of the decision table are tried in order and the first
//! match wins. Plans that need a skeleton model leave their device mapping
//! empty; the lifecycle controller fills it by inference and validates the
//! completed plan before materialization.

use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{
    Device, DeviceMap, DeviceMapping, LoadPlan, LoadStrategy, MaxMemory, MemoryLimit,
    QuantizationConfig,
};
use common::types::{CheckpointFormat, DType, ModelClass, ModelFamily};
use hardware_profiler::HardwareCapabilities;
use loader_config::LoaderSettings;
use resource_manager::{plan_even_split, resolve_max_memory};

use crate::recovery::LoadWarning;

/// Flags that drive precision and placement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Force CPU
    pub cpu: bool,
    /// 8-bit quantization
    pub load_in_8bit: bool,
    /// bfloat16 instead of float16
    pub bf16: bool,
    /// Estimate memory caps from the device
    pub auto_devices: bool,
    /// Explicit per-accelerator caps
    pub gpu_memory: Vec<MemoryLimit>,
    /// Explicit host cap
    pub cpu_memory: Option<MemoryLimit>,
    /// Explicit placement
    pub device_map: Option<DeviceMap>,
}

impl LoadFlags {
    /// Returns true if explicit per-accelerator caps were given
    pub fn has_memory_caps(&self) -> bool {
        !self.gpu_memory.is_empty()
    }

    /// Returns true if the caller asked for capped placement. A host cap
    /// alone is enough to leave the simple accelerator load.
    pub fn wants_capped_placement(&self) -> bool {
        self.auto_devices || self.has_memory_caps() || self.cpu_memory.is_some()
    }

    /// Returns true if no flag alters the simple accelerator load
    pub fn is_plain(&self) -> bool {
        !self.cpu && !self.load_in_8bit && !self.wants_capped_placement()
    }

    fn explicit_or(&self, fallback: DeviceMapping) -> DeviceMapping {
        self.device_map
            .clone()
            .map(DeviceMapping::Explicit)
            .unwrap_or(fallback)
    }
}

impl TryFrom<&LoaderSettings> for LoadFlags {
    type Error = Error;

    fn try_from(settings: &LoaderSettings) -> Result<Self> {
        Ok(Self {
            cpu: settings.cpu,
            load_in_8bit: settings.load_in_8bit,
            bf16: settings.bf16,
            auto_devices: settings.auto_devices,
            gpu_memory: settings.gpu_memory_limits()?,
            cpu_memory: settings.cpu_memory_limit()?,
            device_map: settings.device_map.clone(),
        })
    }
}

/// What the selector needs to know about the checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    /// Transformer layer count
    pub layer_count: usize,
    /// Head class
    pub class: ModelClass,
    /// Tokenizer family
    pub family: ModelFamily,
    /// Checkpoint format
    pub format: CheckpointFormat,
}

/// Selector output
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Plan, possibly awaiting skeleton inference
    pub plan: LoadPlan,
    /// Recoveries taken while selecting
    pub warnings: Vec<LoadWarning>,
}

/// Picks dtype, quantization and placement for a load
pub fn select(
    flags: &LoadFlags,
    hardware: &HardwareCapabilities,
    profile: &ModelProfile,
) -> Result<Selection> {
    let mut warnings = Vec::new();

    if profile.format.is_legacy() {
        info!("Legacy binary checkpoint, delegating to the legacy loader");
        return Ok(Selection {
            plan: base_plan(LoadStrategy::Legacy, Vec::new(), DType::Float32, profile),
            warnings,
        });
    }

    if flags.cpu {
        return Ok(Selection { plan: cpu_plan(profile), warnings });
    }

    if !hardware.has_accelerator() {
        warn!("No accelerator detected, falling back to CPU");
        warnings.push(LoadWarning::CpuFallback);
        return Ok(Selection { plan: cpu_plan(profile), warnings });
    }

    let cuda: Vec<Device> = hardware.cuda_devices().iter().map(|a| a.device()).collect();

    if cuda.is_empty() {
        if flags.load_in_8bit {
            return Err(Error::Config(
                "8-bit quantization requires a CUDA device".to_string(),
            ));
        }
        if !flags.is_plain() {
            debug!("Memory caps ignored on a Metal-only host");
        }
        let device = hardware.preferred_device();
        let plan = base_plan(LoadStrategy::SingleDevice, vec![device], DType::Float32, profile);
        return Ok(Selection { plan, warnings });
    }

    if let Some(map) = &flags.device_map {
        map.check_pinned()?;
    }

    let half = DType::half(flags.bf16);

    if flags.is_plain() {
        let plan = if cuda.len() == 1 {
            base_plan(LoadStrategy::SingleDevice, cuda, half, profile)
        } else {
            let map = match &flags.device_map {
                Some(map) => map.clone(),
                None => plan_even_split(profile.layer_count, cuda.len())?,
            };
            let mut plan = base_plan(LoadStrategy::MultiDeviceDispatch, cuda, half, profile);
            plan.device_mapping = DeviceMapping::Explicit(map);
            plan
        };
        return Ok(Selection { plan, warnings });
    }

    if flags.load_in_8bit {
        let plan = if flags.wants_capped_placement() {
            let caps = resolve_caps(flags, hardware)?.ok_or_else(|| {
                Error::Config(
                    "8-bit quantization with auto_devices needs memory caps to infer a device map, \
                     but none could be resolved; set gpu_memory explicitly"
                        .to_string(),
                )
            })?;
            let mut plan = base_plan(LoadStrategy::QuantizedSkeleton, cuda, DType::Int8, profile);
            plan.requires_skeleton = flags.device_map.is_none();
            plan.device_mapping = flags.explicit_or(DeviceMapping::None);
            plan.max_memory = Some(caps);
            plan.quantization = Some(QuantizationConfig::int8(true));
            plan.low_cpu_mem_usage = true;
            plan
        } else {
            let mut plan = base_plan(LoadStrategy::QuantizedAuto, cuda, DType::Int8, profile);
            plan.device_mapping = flags.explicit_or(DeviceMapping::Auto);
            plan.quantization = Some(QuantizationConfig::int8(false));
            plan.low_cpu_mem_usage = true;
            plan
        };
        return Ok(Selection { plan, warnings });
    }

    let caps = resolve_caps(flags, hardware)?;
    if caps.is_none() {
        warn!("Memory caps requested but none could be resolved, letting the backend place the model");
        warnings.push(LoadWarning::MemoryCapsUnavailable);
    }
    let mut plan = base_plan(LoadStrategy::MemoryCapped, cuda, half, profile);
    plan.device_mapping = flags.explicit_or(DeviceMapping::Auto);
    plan.max_memory = caps;
    plan.low_cpu_mem_usage = true;

    Ok(Selection { plan, warnings })
}

fn resolve_caps(flags: &LoadFlags, hardware: &HardwareCapabilities) -> Result<Option<MaxMemory>> {
    resolve_max_memory(
        &flags.gpu_memory,
        flags.cpu_memory.as_ref(),
        flags.auto_devices,
        hardware,
    )
}

fn cpu_plan(profile: &ModelProfile) -> LoadPlan {
    base_plan(LoadStrategy::Cpu, vec![Device::Cpu], DType::Float32, profile)
}

fn base_plan(
    strategy: LoadStrategy,
    target_devices: Vec<Device>,
    dtype: DType,
    profile: &ModelProfile,
) -> LoadPlan {
    LoadPlan {
        strategy,
        target_devices,
        max_memory: None,
        dtype,
        device_mapping: DeviceMapping::None,
        requires_skeleton: false,
        quantization: None,
        low_cpu_mem_usage: false,
        class: profile.class,
        family: profile.family,
        format: profile.format.clone(),
    }
}
