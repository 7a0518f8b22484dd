//! Memory budgeting and device placement
//!
//! This crate estimates how much memory each accelerator may safely use and
//! turns a layer count plus a device inventory into a device map.

mod budget;
mod device_map;

pub use budget::{resolve_max_memory, MemoryBudgetEstimator, DEFAULT_CPU_MEMORY_GIB};
pub use device_map::{
    plan, plan_even_split, plan_memory_aware, PlanRequest, SegmentFootprint, PINNED_SEGMENTS,
};
