//! Loaded model handle

use std::fmt;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::models::{AdapterSet, Device, DeviceMap, LoadPlan, LoadStrategy, QuantizationConfig};
use common::types::DType;

/// Where the loaded model lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Entirely on one device
    Single(Device),
    /// Spread according to a device map
    Mapped(DeviceMap),
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Single(device) => write!(f, "{}", device),
            Placement::Mapped(map) => write!(f, "device map over {:?} ({} segments)", map.accelerators(), map.len()),
        }
    }
}

/// The currently loaded model and everything decided about it
#[derive(Debug)]
pub struct ModelHandle<M, T> {
    /// Backend model
    pub model: M,

    /// Backend tokenizer
    pub tokenizer: T,

    /// Model name
    pub name: String,

    /// Plan the model was loaded with
    pub plan: LoadPlan,

    /// Current placement
    pub placement: Placement,

    /// Weight dtype
    pub dtype: DType,

    /// Quantization, if any
    pub quantization: Option<QuantizationConfig>,

    /// Adapters merged into the model
    pub adapters: AdapterSet,

    /// Prefix encoder injected
    pub prefix_tuning: bool,

    /// Identifier of this load
    pub load_id: Uuid,

    /// When the load finished
    pub loaded_at: DateTime<Utc>,

    /// How long the load took
    pub load_time: Duration,
}

impl<M, T> ModelHandle<M, T> {
    /// Observable state of the handle, without backend objects
    pub fn summary(&self) -> HandleSummary {
        HandleSummary {
            name: self.name.clone(),
            strategy: self.plan.strategy,
            dtype: self.dtype,
            placement: self.placement.clone(),
            quantization: self.quantization,
            adapters: self.adapters.names().to_vec(),
            prefix_tuning: self.prefix_tuning,
        }
    }
}

/// Serializable view of a [`ModelHandle`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSummary {
    pub name: String,
    pub strategy: LoadStrategy,
    pub dtype: DType,
    pub placement: Placement,
    pub quantization: Option<QuantizationConfig>,
    pub adapters: Vec<String>,
    pub prefix_tuning: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{DeviceMapping, DeviceSlot, Segment};
    use common::types::{CheckpointFormat, ModelClass, ModelFamily};

    #[test]
    fn test_summary_and_display() {
        let plan = LoadPlan {
            strategy: LoadStrategy::SingleDevice,
            target_devices: vec![Device::Cuda(0)],
            max_memory: None,
            dtype: DType::Float16,
            device_mapping: DeviceMapping::None,
            requires_skeleton: false,
            quantization: None,
            low_cpu_mem_usage: false,
            class: ModelClass::CausalLm,
            family: ModelFamily::Standard,
            format: CheckpointFormat::Standard,
        };
        let handle = ModelHandle {
            model: (),
            tokenizer: (),
            name: "m".to_string(),
            plan,
            placement: Placement::Single(Device::Cuda(0)),
            dtype: DType::Float16,
            quantization: None,
            adapters: AdapterSet::empty(),
            prefix_tuning: false,
            load_id: Uuid::new_v4(),
            loaded_at: Utc::now(),
            load_time: Duration::from_millis(5),
        };

        let summary = handle.summary();
        assert_eq!(summary.strategy, LoadStrategy::SingleDevice);
        assert!(summary.adapters.is_empty());
        assert_eq!(handle.placement.to_string(), "cuda:0");

        let mut map = DeviceMap::new();
        map.insert(Segment::Layer(0), DeviceSlot::Accelerator(1));
        assert_eq!(Placement::Mapped(map).to_string(), "device map over [1] (1 segments)");
    }
}
