//! Dry-run backend
//!
//! A [`ModelBackend`] that materializes nothing. Models are plain records of
//! the dtype, placement and adapters a real backend would have produced, and
//! every call is logged so callers can inspect the sequence the controller
//! drove. Device map inference uses the greedy memory-aware planner against
//! footprints derived from a fixed parameter count per layer.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::error::{Error, Result};
use common::models::{Device, DeviceMap, DeviceMapping, LoadPlan, MaxMemory, ModelSource, Segment};
use common::types::{DType, ModelClass};
use hardware_profiler::{AcceleratorInfo, AcceleratorProbe};
use resource_manager::{plan, PlanRequest, SegmentFootprint};

use crate::backend::{
    AdapterMergeParams, ModelBackend, ModelConfig, SpecialTokenIds, StateDict, TokenizerKind,
};

/// Parameters per transformer layer assumed when none is configured
pub const DEFAULT_PARAMS_PER_LAYER: u64 = 200_000_000;

/// Vocabulary size of dry-run tokenizers
pub const DEFAULT_VOCAB_SIZE: usize = 130_528;

/// Call made against the dry-run backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendCall {
    LoadConfig(String),
    FromPretrained { dtype: DType, device_map: bool },
    FromConfig,
    InferDeviceMap(DType),
    Dispatch,
    ToDevice(Device),
    LoadTokenizer(TokenizerKind),
    SetSpecialTokenIds,
    LoadLegacy(PathBuf),
    EmptyCache,
    ResizeTokenEmbeddings(usize),
    MergeBaseAdapter(String),
    LoadAdapter(String),
    DisableAdapters,
    LoadStateDict,
    LoadPrefixEncoder(usize),
    PrefixEncoderToFloat,
    Eval,
}

impl BackendCall {
    /// Operation name, as used by [`DryRunBackend::failing_on`]
    pub fn op(&self) -> &'static str {
        match self {
            BackendCall::LoadConfig(_) => "load_config",
            BackendCall::FromPretrained { .. } => "from_pretrained",
            BackendCall::FromConfig => "from_config",
            BackendCall::InferDeviceMap(_) => "infer_device_map",
            BackendCall::Dispatch => "dispatch",
            BackendCall::ToDevice(_) => "to_device",
            BackendCall::LoadTokenizer(_) => "load_tokenizer",
            BackendCall::SetSpecialTokenIds => "set_special_token_ids",
            BackendCall::LoadLegacy(_) => "load_legacy",
            BackendCall::EmptyCache => "empty_cache",
            BackendCall::ResizeTokenEmbeddings(_) => "resize_token_embeddings",
            BackendCall::MergeBaseAdapter(_) => "merge_base_adapter",
            BackendCall::LoadAdapter(_) => "load_adapter",
            BackendCall::DisableAdapters => "disable_adapters",
            BackendCall::LoadStateDict => "load_state_dict",
            BackendCall::LoadPrefixEncoder(_) => "load_prefix_encoder",
            BackendCall::PrefixEncoderToFloat => "prefix_encoder_to_float",
            BackendCall::Eval => "eval",
        }
    }
}

/// Prefix encoder injected into a dry-run model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunPrefixEncoder {
    /// Tensor names loaded into the encoder
    pub keys: Vec<String>,
    /// Encoder dtype
    pub dtype: DType,
}

/// Model record produced by the dry-run backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunModel {
    pub class: ModelClass,
    pub dtype: DType,
    pub skeleton: bool,
    pub device: Device,
    pub device_map: Option<DeviceMap>,
    pub num_layers: usize,
    pub vocab_size: usize,
    pub adapters: Vec<String>,
    pub prefix_encoder: Option<DryRunPrefixEncoder>,
    pub eval: bool,
}

impl DryRunModel {
    /// A fully loaded model on `device`
    pub fn loaded(dtype: DType, device: Device) -> Self {
        Self {
            class: ModelClass::CausalLm,
            dtype,
            skeleton: false,
            device,
            device_map: None,
            num_layers: 0,
            vocab_size: DEFAULT_VOCAB_SIZE,
            adapters: Vec::new(),
            prefix_encoder: None,
            eval: false,
        }
    }
}

/// Tokenizer record produced by the dry-run backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunTokenizer {
    pub kind: TokenizerKind,
    pub vocab_size: usize,
    pub special_tokens: Option<SpecialTokenIds>,
}

/// Backend that plans and records without loading weights
#[derive(Debug)]
pub struct DryRunBackend {
    accelerators: Vec<AcceleratorInfo>,
    config: ModelConfig,
    params_per_layer: u64,
    vocab_size: usize,
    failing: BTreeSet<&'static str>,
    calls: Mutex<Vec<BackendCall>>,
}

impl Default for DryRunBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunBackend {
    /// Backend without accelerators serving a 28-layer model
    pub fn new() -> Self {
        Self {
            accelerators: Vec::new(),
            config: ModelConfig::with_layers(28),
            params_per_layer: DEFAULT_PARAMS_PER_LAYER,
            vocab_size: DEFAULT_VOCAB_SIZE,
            failing: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reports `accelerators`
    pub fn with_accelerators(mut self, accelerators: Vec<AcceleratorInfo>) -> Self {
        self.accelerators = accelerators;
        self
    }

    /// Serves `config` for sources without a `config.json`
    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    /// Assumed parameter count of one layer
    pub fn with_params_per_layer(mut self, params: u64) -> Self {
        self.params_per_layer = params;
        self
    }

    /// Makes every call of operation `op` fail with a backend error
    pub fn failing_on(mut self, op: &'static str) -> Self {
        self.failing.insert(op);
        self
    }

    /// Stops failing `op`
    pub fn recover(&mut self, op: &str) {
        self.failing.remove(op);
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// A fresh tokenizer, as `load_tokenizer` would build it
    pub fn dry_tokenizer(&self) -> DryRunTokenizer {
        DryRunTokenizer {
            kind: TokenizerKind::Auto,
            vocab_size: self.vocab_size,
            special_tokens: None,
        }
    }

    /// Estimated footprints of every segment at `dtype`
    pub fn footprints(&self, num_layers: usize, dtype: DType) -> Vec<SegmentFootprint> {
        let layer_bytes = self.params_per_layer * dtype.size_in_bytes();
        let mut footprints = vec![SegmentFootprint {
            segment: Segment::Embedding,
            bytes: layer_bytes / 2,
        }];
        footprints.extend((0..num_layers).map(|index| SegmentFootprint {
            segment: Segment::Layer(index),
            bytes: layer_bytes,
        }));
        footprints.push(SegmentFootprint {
            segment: Segment::FinalNorm,
            bytes: layer_bytes / 1000,
        });
        footprints.push(SegmentFootprint {
            segment: Segment::OutputHead,
            bytes: layer_bytes / 2,
        });
        footprints
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        let op = call.op();
        debug!(?call, "Dry-run backend call");
        self.calls.lock().push(call);
        if self.failing.contains(op) {
            return Err(Error::Backend(format!("{} failed (injected)", op)));
        }
        Ok(())
    }

    fn cuda_count(&self, plan: &LoadPlan) -> usize {
        plan.target_devices
            .iter()
            .filter(|d| matches!(d, Device::Cuda(_)))
            .count()
    }

    fn infer(&self, num_layers: usize, dtype: DType, max_memory: Option<&MaxMemory>, devices: usize) -> Result<DeviceMap> {
        let footprints = self.footprints(num_layers, dtype);
        plan(PlanRequest {
            layer_count: num_layers,
            device_count: devices.max(1),
            max_memory,
            footprints: Some(&footprints),
        })
    }

    fn check_adapter_dir(path: &Path) -> Result<()> {
        if path.is_dir() {
            Ok(())
        } else {
            Err(Error::Adapter(format!("Adapter directory not found: {}", path.display())))
        }
    }
}

impl AcceleratorProbe for DryRunBackend {
    fn accelerators(&self) -> Vec<AcceleratorInfo> {
        self.accelerators.clone()
    }
}

impl ModelBackend for DryRunBackend {
    type Model = DryRunModel;
    type Tokenizer = DryRunTokenizer;
    type Tensor = Vec<f32>;

    fn load_config(&self, source: &ModelSource, _trust_remote_code: bool) -> Result<ModelConfig> {
        self.record(BackendCall::LoadConfig(source.to_string()))?;
        match source {
            ModelSource::Local(dir) if !dir.exists() => Err(Error::NotFound(format!(
                "Model directory not found: {}",
                dir.display()
            ))),
            ModelSource::Local(dir) if dir.join("config.json").is_file() => {
                let raw = fs::read_to_string(dir.join("config.json"))?;
                Ok(serde_json::from_str(&raw)?)
            }
            _ => Ok(self.config.clone()),
        }
    }

    fn from_pretrained(
        &self,
        _source: &ModelSource,
        config: &ModelConfig,
        plan: &LoadPlan,
        _trust_remote_code: bool,
    ) -> Result<DryRunModel> {
        self.record(BackendCall::FromPretrained {
            dtype: plan.dtype,
            device_map: plan.device_mapping != DeviceMapping::None,
        })?;

        let device_map = match &plan.device_mapping {
            DeviceMapping::None => None,
            DeviceMapping::Explicit(map) => Some(map.clone()),
            DeviceMapping::Auto => Some(self.infer(
                config.num_layers,
                plan.dtype,
                plan.max_memory.as_ref(),
                self.cuda_count(plan),
            )?),
        };

        Ok(DryRunModel {
            class: plan.class,
            num_layers: config.num_layers,
            vocab_size: config.vocab_size.unwrap_or(self.vocab_size),
            device_map,
            ..DryRunModel::loaded(plan.dtype, Device::Cpu)
        })
    }

    fn from_config(&self, config: &ModelConfig, class: ModelClass) -> Result<DryRunModel> {
        self.record(BackendCall::FromConfig)?;
        Ok(DryRunModel {
            class,
            skeleton: true,
            num_layers: config.num_layers,
            ..DryRunModel::loaded(DType::Float32, Device::Cpu)
        })
    }

    fn no_split_modules(&self, _model: &DryRunModel) -> Vec<String> {
        vec!["TransformerLayer".to_string()]
    }

    fn infer_device_map(
        &self,
        model: &DryRunModel,
        dtype: DType,
        max_memory: &MaxMemory,
        _no_split_modules: &[String],
    ) -> Result<DeviceMap> {
        self.record(BackendCall::InferDeviceMap(dtype))?;
        self.infer(model.num_layers, dtype, Some(max_memory), max_memory.devices.len())
    }

    fn dispatch(&self, model: &mut DryRunModel, device_map: &DeviceMap) -> Result<()> {
        self.record(BackendCall::Dispatch)?;
        model.device_map = Some(device_map.clone());
        Ok(())
    }

    fn to_device(&self, model: &mut DryRunModel, device: Device) -> Result<()> {
        self.record(BackendCall::ToDevice(device))?;
        model.device = device;
        model.device_map = None;
        Ok(())
    }

    fn model_device_map(&self, model: &DryRunModel) -> Option<DeviceMap> {
        model.device_map.clone()
    }

    fn model_dtype(&self, model: &DryRunModel) -> DType {
        model.dtype
    }

    fn load_tokenizer(
        &self,
        _source: &ModelSource,
        kind: TokenizerKind,
        _trust_remote_code: bool,
    ) -> Result<DryRunTokenizer> {
        self.record(BackendCall::LoadTokenizer(kind))?;
        Ok(DryRunTokenizer {
            kind,
            ..self.dry_tokenizer()
        })
    }

    fn set_special_token_ids(&self, tokenizer: &mut DryRunTokenizer, ids: SpecialTokenIds) -> Result<()> {
        self.record(BackendCall::SetSpecialTokenIds)?;
        tokenizer.special_tokens = Some(ids);
        Ok(())
    }

    fn tokenizer_len(&self, tokenizer: &DryRunTokenizer) -> usize {
        tokenizer.vocab_size
    }

    fn load_legacy(&self, weights: &Path) -> Result<(DryRunModel, DryRunTokenizer)> {
        self.record(BackendCall::LoadLegacy(weights.to_path_buf()))?;
        if !weights.is_file() {
            return Err(Error::NotFound(format!(
                "Legacy weights not found: {}",
                weights.display()
            )));
        }
        Ok((
            DryRunModel::loaded(DType::Float32, Device::Cpu),
            self.dry_tokenizer(),
        ))
    }

    fn empty_cache(&self) -> Result<()> {
        self.record(BackendCall::EmptyCache)
    }

    fn resize_token_embeddings(&self, model: &mut DryRunModel, vocab_size: usize) -> Result<()> {
        self.record(BackendCall::ResizeTokenEmbeddings(vocab_size))?;
        model.vocab_size = vocab_size;
        Ok(())
    }

    fn merge_base_adapter(
        &self,
        model: &mut DryRunModel,
        path: &Path,
        name: &str,
        params: &AdapterMergeParams,
    ) -> Result<()> {
        self.record(BackendCall::MergeBaseAdapter(name.to_string()))?;
        Self::check_adapter_dir(path)?;

        model.adapters = vec![name.to_string()];
        if let Some(dtype) = params.dtype {
            model.dtype = dtype;
        }
        if params.device_map.is_none() {
            // a fresh merge lands on the host
            model.device = Device::Cpu;
            model.device_map = None;
        }
        Ok(())
    }

    fn load_adapter(&self, model: &mut DryRunModel, path: &Path, name: &str) -> Result<()> {
        self.record(BackendCall::LoadAdapter(name.to_string()))?;
        Self::check_adapter_dir(path)?;
        model.adapters.push(name.to_string());
        Ok(())
    }

    fn disable_adapters(&self, model: &mut DryRunModel) -> Result<()> {
        self.record(BackendCall::DisableAdapters)?;
        model.adapters.clear();
        Ok(())
    }

    fn load_state_dict(&self, path: &Path) -> Result<StateDict<Vec<f32>>> {
        self.record(BackendCall::LoadStateDict)?;
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn load_prefix_encoder(&self, model: &mut DryRunModel, state: StateDict<Vec<f32>>) -> Result<()> {
        self.record(BackendCall::LoadPrefixEncoder(state.len()))?;
        model.prefix_encoder = Some(DryRunPrefixEncoder {
            keys: state.into_keys().collect(),
            dtype: model.dtype,
        });
        Ok(())
    }

    fn prefix_encoder_to_float(&self, model: &mut DryRunModel) -> Result<()> {
        self.record(BackendCall::PrefixEncoderToFloat)?;
        let encoder = model
            .prefix_encoder
            .as_mut()
            .ok_or_else(|| Error::Model("Model has no prefix encoder".to_string()))?;
        encoder.dtype = DType::Float32;
        Ok(())
    }

    fn eval(&self, model: &mut DryRunModel) -> Result<()> {
        self.record(BackendCall::Eval)?;
        model.eval = true;
        Ok(())
    }
}
