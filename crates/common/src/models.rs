//! Placement and precision data model
//!
//! These are the values that flow between the selector, the planner and the
//! lifecycle controller: where each model segment lives, how much memory each
//! device may use, and the immutable load plan built from them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CheckpointFormat, DType, ModelClass, ModelFamily};
use crate::utils::{parse_binary_size, GIB};

/// Device a whole model (or an adapter merge) is moved to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host CPU
    Cpu,
    /// CUDA accelerator by index
    Cuda(usize),
    /// Apple Metal accelerator
    Mps,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
            Device::Mps => write!(f, "mps"),
        }
    }
}

/// Where a device-map entry puts its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSlot {
    /// Accelerator index
    Accelerator(usize),
    /// Offloaded segment
    Offload(OffloadTarget),
}

/// Offload destinations an inferred map may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadTarget {
    /// Host memory
    Cpu,
    /// Disk
    Disk,
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSlot::Accelerator(index) => write!(f, "{}", index),
            DeviceSlot::Offload(OffloadTarget::Cpu) => write!(f, "cpu"),
            DeviceSlot::Offload(OffloadTarget::Disk) => write!(f, "disk"),
        }
    }
}

const EMBEDDING_SEGMENT: &str = "transformer.word_embeddings";
const LAYER_SEGMENT_PREFIX: &str = "transformer.layers.";
const FINAL_NORM_SEGMENT: &str = "transformer.final_layernorm";
const OUTPUT_HEAD_SEGMENT: &str = "lm_head";

/// Named part of a model that a device map places
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Input embedding lookup
    Embedding,
    /// Transformer block by index
    Layer(usize),
    /// Final normalization
    FinalNorm,
    /// Output head
    OutputHead,
    /// Any other module name produced by map inference
    Named(String),
}

impl Segment {
    /// Parses a module name back into a segment
    pub fn parse(name: &str) -> Self {
        match name {
            EMBEDDING_SEGMENT => Segment::Embedding,
            FINAL_NORM_SEGMENT => Segment::FinalNorm,
            OUTPUT_HEAD_SEGMENT => Segment::OutputHead,
            other => other
                .strip_prefix(LAYER_SEGMENT_PREFIX)
                .and_then(|index| index.parse().ok())
                .map(Segment::Layer)
                .unwrap_or_else(|| Segment::Named(other.to_string())),
        }
    }

    /// Returns true for the segments that must share device 0
    pub fn is_pinned(&self) -> bool {
        matches!(self, Segment::Embedding | Segment::FinalNorm | Segment::OutputHead)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Embedding => f.write_str(EMBEDDING_SEGMENT),
            Segment::Layer(index) => write!(f, "{}{}", LAYER_SEGMENT_PREFIX, index),
            Segment::FinalNorm => f.write_str(FINAL_NORM_SEGMENT),
            Segment::OutputHead => f.write_str(OUTPUT_HEAD_SEGMENT),
            Segment::Named(name) => f.write_str(name),
        }
    }
}

/// One placement decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapEntry {
    /// Segment being placed
    pub segment: Segment,
    /// Where it goes
    pub slot: DeviceSlot,
}

/// Ordered mapping from model segments to devices
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, DeviceSlot>", into = "BTreeMap<String, DeviceSlot>")]
pub struct DeviceMap {
    entries: Vec<DeviceMapEntry>,
}

impl DeviceMap {
    /// Creates an empty device map
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a segment, replacing any earlier placement of the same segment
    pub fn insert(&mut self, segment: Segment, slot: DeviceSlot) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.segment == segment) {
            entry.slot = slot;
        } else {
            self.entries.push(DeviceMapEntry { segment, slot });
        }
    }

    /// Gets the placement of a segment
    pub fn get(&self, segment: &Segment) -> Option<DeviceSlot> {
        self.entries
            .iter()
            .find(|e| &e.segment == segment)
            .map(|e| e.slot)
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[DeviceMapEntry] {
        &self.entries
    }

    /// Number of placed segments
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is placed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accelerator indices used by the map, ascending
    pub fn accelerators(&self) -> Vec<usize> {
        self.entries
            .iter()
            .filter_map(|e| match e.slot {
                DeviceSlot::Accelerator(index) => Some(index),
                DeviceSlot::Offload(_) => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns true if segments live on more than one slot
    pub fn is_multi_device(&self) -> bool {
        self.entries
            .iter()
            .map(|e| e.slot)
            .collect::<BTreeSet<_>>()
            .len()
            > 1
    }

    /// Transformer layers placed on an accelerator, in layer order
    pub fn layers_on(&self, device: usize) -> Vec<usize> {
        let mut layers: Vec<usize> = self
            .entries
            .iter()
            .filter_map(|e| match (&e.segment, e.slot) {
                (Segment::Layer(index), DeviceSlot::Accelerator(d)) if d == device => Some(*index),
                _ => None,
            })
            .collect();
        layers.sort_unstable();
        layers
    }

    /// Fails if a pinned segment present in the map is off accelerator 0
    pub fn check_pinned(&self) -> Result<()> {
        let misplaced: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.segment.is_pinned() && e.slot != DeviceSlot::Accelerator(0))
            .map(|e| format!("{} -> {}", e.segment, e.slot))
            .collect();
        if misplaced.is_empty() {
            return Ok(());
        }
        Err(Error::Config(format!(
            "Embedding, final norm and output head must share accelerator 0, got {}",
            misplaced.join(", ")
        )))
    }

    /// Plain name map with every key prefixed, as an adapter merge expects
    pub fn prefixed(&self, prefix: &str) -> BTreeMap<String, DeviceSlot> {
        self.entries
            .iter()
            .map(|e| (format!("{}{}", prefix, e.segment), e.slot))
            .collect()
    }
}

impl From<BTreeMap<String, DeviceSlot>> for DeviceMap {
    fn from(raw: BTreeMap<String, DeviceSlot>) -> Self {
        let mut map = DeviceMap::new();
        for (name, slot) in raw {
            map.insert(Segment::parse(&name), slot);
        }
        map
    }
}

impl From<DeviceMap> for BTreeMap<String, DeviceSlot> {
    fn from(map: DeviceMap) -> Self {
        map.prefixed("")
    }
}

/// Memory cap in the form the serving backend accepts, e.g. `"10GiB"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryLimit {
    text: String,
    bytes: u64,
}

impl MemoryLimit {
    /// Normalizes a user-supplied value: strings already carrying a binary
    /// unit pass through verbatim, bare numbers are whole GiB.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("Empty memory limit".to_string()));
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let unit = trimmed[split..].trim().to_lowercase();

        let text = match unit.as_str() {
            "" => format!("{}GiB", trimmed),
            binary if binary.ends_with("ib") => trimmed.to_string(),
            "kb" | "mb" | "gb" | "tb" => {
                return Err(Error::InvalidArgument(format!(
                    "Memory limit '{}' uses a decimal unit; use a binary unit such as {}iB, \
                     or a bare number of GiB",
                    trimmed,
                    unit[..1].to_uppercase()
                )))
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "Unsupported memory unit '{}' in memory limit '{}'",
                    other, trimmed
                )))
            }
        };
        let bytes = parse_binary_size(&text)?;

        Ok(Self { text, bytes })
    }

    /// Limit of a whole number of GiB
    pub fn gib(units: u64) -> Self {
        Self {
            text: format!("{}GiB", units),
            bytes: units * GIB,
        }
    }

    /// Limit in bytes
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Normalized text
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl TryFrom<String> for MemoryLimit {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        MemoryLimit::parse(&raw)
    }
}

impl From<MemoryLimit> for String {
    fn from(limit: MemoryLimit) -> Self {
        limit.text
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Per-device memory caps handed to placement inference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxMemory {
    /// Accelerator index to cap
    pub devices: BTreeMap<usize, MemoryLimit>,
    /// Host memory cap
    pub cpu: MemoryLimit,
}

/// 8-bit quantization settings attached to a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Always true; weights are loaded as int8
    pub load_in_8bit: bool,
    /// Keep offloaded modules in fp32 on the CPU
    pub enable_fp32_cpu_offload: bool,
}

impl QuantizationConfig {
    /// 8-bit config, optionally allowing fp32 CPU offload
    pub fn int8(enable_fp32_cpu_offload: bool) -> Self {
        Self {
            load_in_8bit: true,
            enable_fp32_cpu_offload,
        }
    }
}

/// Device-map argument of a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMapping {
    /// No map; the model lands on a single device
    #[default]
    None,
    /// The serving backend infers the map itself
    Auto,
    /// A concrete map
    Explicit(DeviceMap),
}

impl DeviceMapping {
    /// Concrete map, if any
    pub fn explicit(&self) -> Option<&DeviceMap> {
        match self {
            DeviceMapping::Explicit(map) => Some(map),
            _ => None,
        }
    }
}

/// Row of the precision decision table that produced a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// float32 on the CPU
    Cpu,
    /// Half precision on one accelerator
    SingleDevice,
    /// Half precision, contiguous map dispatched after construction
    MultiDeviceDispatch,
    /// Half precision with memory caps, map inferred by the backend
    MemoryCapped,
    /// int8 with memory caps, map inferred against a skeleton model
    QuantizedSkeleton,
    /// int8, map inferred by the backend
    QuantizedAuto,
    /// Legacy binary weights, handed to the legacy loader
    Legacy,
}

/// Where a checkpoint is read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// Directory on the local file system
    Local(PathBuf),
    /// Remote identifier resolved by the backend
    Remote(String),
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::Remote(id) => f.write_str(id),
        }
    }
}

/// Immutable description of how a model is to be instantiated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPlan {
    /// Decision table row
    pub strategy: LoadStrategy,
    /// Target devices in order
    pub target_devices: Vec<Device>,
    /// Per-device memory caps
    pub max_memory: Option<MaxMemory>,
    /// Weight dtype
    pub dtype: DType,
    /// Device-map argument
    pub device_mapping: DeviceMapping,
    /// Build an uninitialized model first and infer the map against it
    pub requires_skeleton: bool,
    /// Quantization config, set for int8 loads
    pub quantization: Option<QuantizationConfig>,
    /// Stream weights instead of building a full copy in host memory
    pub low_cpu_mem_usage: bool,
    /// Model head class
    pub class: ModelClass,
    /// Tokenizer family
    pub family: ModelFamily,
    /// Checkpoint format
    pub format: CheckpointFormat,
}

impl LoadPlan {
    /// Checks the invariants a plan must hold before materialization
    pub fn validate(&self) -> Result<()> {
        if self.dtype == DType::Int8 && self.max_memory.is_some() {
            match &self.device_mapping {
                DeviceMapping::Explicit(map) if !map.is_empty() => {}
                _ => {
                    return Err(Error::Config(
                        "8-bit load with memory caps requires an inferred device map".to_string(),
                    ))
                }
            }
        }

        if self.strategy == LoadStrategy::MultiDeviceDispatch
            && self.device_mapping.explicit().map_or(true, DeviceMap::is_empty)
        {
            return Err(Error::Config(
                "Multi-device dispatch requires a device map".to_string(),
            ));
        }

        if let DeviceMapping::Explicit(map) = &self.device_mapping {
            map.check_pinned()?;
        }

        if self.target_devices.is_empty() && !self.format.is_legacy() {
            return Err(Error::Config("Load plan has no target device".to_string()));
        }

        Ok(())
    }

    /// Returns true when the model will be spread over several devices
    pub fn is_multi_device(&self) -> bool {
        match &self.device_mapping {
            DeviceMapping::Explicit(map) => map.is_multi_device(),
            DeviceMapping::Auto => true,
            DeviceMapping::None => false,
        }
    }
}

/// Outcome of the most recent adapter reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdapterDiff {
    /// Adapters that were not attached before
    pub to_add: BTreeSet<String>,
    /// Attached adapters that are no longer wanted
    pub to_remove: BTreeSet<String>,
}

/// Immutable snapshot of the adapters merged into a model
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AdapterSet {
    names: Vec<String>,
    last_diff: AdapterDiff,
}

impl AdapterSet {
    /// Creates an empty adapter set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of `names` produced by `diff`
    pub fn new(names: Vec<String>, last_diff: AdapterDiff) -> Self {
        Self { names, last_diff }
    }

    /// Attached adapters; the first one is the base merge
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Set view of the attached adapters
    pub fn as_set(&self) -> BTreeSet<String> {
        self.names.iter().cloned().collect()
    }

    /// Diff that produced this snapshot
    pub fn last_diff(&self) -> &AdapterDiff {
        &self.last_diff
    }

    /// Returns true when no adapter is attached
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of attached adapters
    pub fn len(&self) -> usize {
        self.names.len()
    }
}
