//! Device map planning
//!
//! Two planners live here. The even split walks transformer layers in order
//! and fills devices contiguously, with the embedding, final norm and output
//! head pinned to device 0. The memory-aware planner does the same walk but
//! advances when a device's remaining budget cannot hold the next segment.

use tracing::debug;

use common::error::{Error, Result};
use common::models::{DeviceMap, DeviceSlot, MaxMemory, OffloadTarget, Segment};

/// Segments counted against device 0 before any layer is placed: the
/// embedding, and the final norm + output head pair.
pub const PINNED_SEGMENTS: usize = 2;

/// Estimated parameter memory of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFootprint {
    /// Segment
    pub segment: Segment,
    /// Bytes at the target dtype
    pub bytes: u64,
}

/// Inputs of a placement decision
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    /// Number of transformer layers
    pub layer_count: usize,
    /// Number of accelerators to spread over
    pub device_count: usize,
    /// Per-device caps, when the caller set or estimated them
    pub max_memory: Option<&'a MaxMemory>,
    /// Per-segment footprints, when they could be estimated
    pub footprints: Option<&'a [SegmentFootprint]>,
}

/// Picks the planner: memory-aware when both caps and footprints are known,
/// the contiguous even split otherwise.
pub fn plan(request: PlanRequest<'_>) -> Result<DeviceMap> {
    match (request.max_memory, request.footprints) {
        (Some(max_memory), Some(footprints)) => plan_memory_aware(footprints, max_memory),
        _ => plan_even_split(request.layer_count, request.device_count),
    }
}

/// Contiguous even split of `layer_count` layers over `device_count` devices
pub fn plan_even_split(layer_count: usize, device_count: usize) -> Result<DeviceMap> {
    if device_count == 0 {
        return Err(Error::Config(
            "Device map requested for zero devices".to_string(),
        ));
    }

    let total_segments = layer_count + PINNED_SEGMENTS;
    let per_device = total_segments as f64 / device_count as f64;

    let mut map = DeviceMap::new();
    map.insert(Segment::Embedding, DeviceSlot::Accelerator(0));
    map.insert(Segment::FinalNorm, DeviceSlot::Accelerator(0));
    map.insert(Segment::OutputHead, DeviceSlot::Accelerator(0));

    let mut used = PINNED_SEGMENTS;
    let mut target = 0;

    for layer in 0..layer_count {
        if used as f64 >= per_device {
            target += 1;
            used = 0;
        }
        if target >= device_count {
            return Err(Error::Config(format!(
                "Layer {} does not fit: {} layers over {} devices at {:.2} segments per device",
                layer, layer_count, device_count, per_device
            )));
        }
        map.insert(Segment::Layer(layer), DeviceSlot::Accelerator(target));
        used += 1;
    }

    debug!(
        layers = layer_count,
        devices = device_count,
        per_device,
        "Planned even split device map"
    );

    Ok(map)
}

/// Greedy placement against per-device budgets.
///
/// Pinned segments are charged to device 0 first. Layers then fill devices in
/// ascending order; once the accelerators are exhausted they spill to the CPU
/// budget. Running out of every budget is a configuration error.
pub fn plan_memory_aware(footprints: &[SegmentFootprint], max_memory: &MaxMemory) -> Result<DeviceMap> {
    let mut budgets: Vec<(DeviceSlot, u64)> = max_memory
        .devices
        .iter()
        .map(|(index, limit)| (DeviceSlot::Accelerator(*index), limit.bytes()))
        .collect();
    budgets.push((DeviceSlot::Offload(OffloadTarget::Cpu), max_memory.cpu.bytes()));

    let first_device = budgets
        .first()
        .map(|(slot, _)| *slot)
        .unwrap_or(DeviceSlot::Offload(OffloadTarget::Cpu));

    let mut map = DeviceMap::new();
    for footprint in footprints.iter().filter(|f| f.segment.is_pinned()) {
        let budget = &mut budgets[0].1;
        *budget = budget.checked_sub(footprint.bytes).ok_or_else(|| {
            Error::Config(format!(
                "Segment {} ({}) does not fit on device {}",
                footprint.segment,
                common::utils::format_bytes(footprint.bytes),
                first_device
            ))
        })?;
        map.insert(footprint.segment.clone(), first_device);
    }

    let mut current = 0;
    for footprint in footprints.iter().filter(|f| !f.segment.is_pinned()) {
        while current < budgets.len() && budgets[current].1 < footprint.bytes {
            current += 1;
        }
        let Some((slot, remaining)) = budgets.get_mut(current) else {
            return Err(Error::Config(format!(
                "Segment {} ({}) exceeds the remaining memory of every device",
                footprint.segment,
                common::utils::format_bytes(footprint.bytes)
            )));
        };
        *remaining -= footprint.bytes;
        map.insert(footprint.segment.clone(), *slot);
    }

    debug!(
        segments = map.len(),
        devices = ?map.accelerators(),
        "Planned memory-aware device map"
    );

    Ok(map)
}
