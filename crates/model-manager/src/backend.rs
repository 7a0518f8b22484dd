//! Model-serving collaborator interface
//!
//! This module defines the seam between the lifecycle controller and the
//! runtime that actually owns tensors: configuration and checkpoint loading,
//! skeleton construction, device map inference and dispatch, tokenizers,
//! adapter merging and prefix-encoder injection. The controller never touches
//! weights itself; it decides and sequences, the backend executes.

use std::collections::BTreeMap;
use std::path::Path;
use serde::{Deserialize, Serialize};

use common::error::Result;
use common::models::{Device, DeviceMap, DeviceSlot, LoadPlan, MaxMemory, ModelSource};
use common::types::{DType, ModelClass, ModelFamily};
use hardware_profiler::AcceleratorProbe;

/// Named tensors as read from a weights file
pub type StateDict<T> = BTreeMap<String, T>;

/// Model configuration fields the loader reads or overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers
    #[serde(alias = "num_hidden_layers", alias = "n_layer")]
    pub num_layers: usize,

    /// Vocabulary size of the embedding
    #[serde(default)]
    pub vocab_size: Option<usize>,

    /// Architecture family identifier
    #[serde(default)]
    pub model_type: Option<String>,

    /// Architecture class names
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Prefix length, set when prefix tuning is enabled
    #[serde(default)]
    pub pre_seq_len: Option<usize>,

    /// Whether the prefix encoder projects through an MLP
    #[serde(default)]
    pub prefix_projection: bool,
}

impl ModelConfig {
    /// Configuration of a model with `num_layers` transformer layers
    pub fn with_layers(num_layers: usize) -> Self {
        Self {
            num_layers,
            vocab_size: None,
            model_type: None,
            architectures: Vec::new(),
            pre_seq_len: None,
            prefix_projection: false,
        }
    }

    /// Tokenizer family implied by the configuration
    pub fn family(&self) -> ModelFamily {
        let llama_type = self
            .model_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case("llama"));
        let llama_arch = self
            .architectures
            .iter()
            .any(|a| a.starts_with("Llama"));

        if llama_type || llama_arch {
            ModelFamily::Llama
        } else {
            ModelFamily::Standard
        }
    }
}

/// Tokenizer loading path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    /// Generic tokenizer resolution
    Auto,
    /// Llama tokenizer class
    Llama,
}

impl From<ModelFamily> for TokenizerKind {
    fn from(family: ModelFamily) -> Self {
        match family {
            ModelFamily::Standard => TokenizerKind::Auto,
            ModelFamily::Llama => TokenizerKind::Llama,
        }
    }
}

/// Reserved token ids force-set after tokenizer construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokenIds {
    /// End of sequence
    pub eos: u32,
    /// Beginning of sequence
    pub bos: u32,
    /// Padding
    pub pad: u32,
}

impl SpecialTokenIds {
    /// Ids Llama checkpoints expect regardless of their tokenizer files
    pub const LLAMA: SpecialTokenIds = SpecialTokenIds { eos: 2, bos: 1, pad: 0 };
}

/// Extra arguments of a base adapter merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMergeParams {
    /// dtype the adapter weights are cast to
    pub dtype: Option<DType>,
    /// Placement of the merged model, keyed by merged-model module names
    pub device_map: Option<BTreeMap<String, DeviceSlot>>,
}

/// Runtime that materializes models for the lifecycle controller.
///
/// Implementations report their accelerators through [`AcceleratorProbe`].
/// Every call is synchronous and runs to completion on the calling thread.
pub trait ModelBackend: AcceleratorProbe {
    /// Loaded model
    type Model;
    /// Loaded tokenizer
    type Tokenizer;
    /// Tensor type of state dicts
    type Tensor;

    /// Reads the model configuration
    fn load_config(&self, source: &ModelSource, trust_remote_code: bool) -> Result<ModelConfig>;

    /// Materializes weights according to the plan's dtype, device mapping,
    /// memory caps and quantization
    fn from_pretrained(
        &self,
        source: &ModelSource,
        config: &ModelConfig,
        plan: &LoadPlan,
        trust_remote_code: bool,
    ) -> Result<Self::Model>;

    /// Builds an uninitialized model without allocating weights
    fn from_config(&self, config: &ModelConfig, class: ModelClass) -> Result<Self::Model>;

    /// Module class names that must not be split across devices
    fn no_split_modules(&self, model: &Self::Model) -> Vec<String>;

    /// Infers a placement for `model` at `dtype` under `max_memory`
    fn infer_device_map(
        &self,
        model: &Self::Model,
        dtype: DType,
        max_memory: &MaxMemory,
        no_split_modules: &[String],
    ) -> Result<DeviceMap>;

    /// Spreads an already materialized model over devices
    fn dispatch(&self, model: &mut Self::Model, device_map: &DeviceMap) -> Result<()>;

    /// Moves the whole model to one device
    fn to_device(&self, model: &mut Self::Model, device: Device) -> Result<()>;

    /// Current placement of the model, if it was loaded with a device map
    fn model_device_map(&self, model: &Self::Model) -> Option<DeviceMap>;

    /// Current weight dtype of the model
    fn model_dtype(&self, model: &Self::Model) -> DType;

    /// Loads the tokenizer
    fn load_tokenizer(
        &self,
        source: &ModelSource,
        kind: TokenizerKind,
        trust_remote_code: bool,
    ) -> Result<Self::Tokenizer>;

    /// Overrides the reserved token ids of a tokenizer
    fn set_special_token_ids(&self, tokenizer: &mut Self::Tokenizer, ids: SpecialTokenIds) -> Result<()>;

    /// Number of tokens the tokenizer knows
    fn tokenizer_len(&self, tokenizer: &Self::Tokenizer) -> usize;

    /// Loads a legacy binary checkpoint together with its tokenizer
    fn load_legacy(&self, weights: &Path) -> Result<(Self::Model, Self::Tokenizer)>;

    /// Releases cached accelerator allocations; a no-op without accelerators
    fn empty_cache(&self) -> Result<()>;

    /// Resizes input embeddings to `vocab_size` tokens
    fn resize_token_embeddings(&self, model: &mut Self::Model, vocab_size: usize) -> Result<()>;

    /// Wraps the model with the adapter at `path` as its base merge
    fn merge_base_adapter(
        &self,
        model: &mut Self::Model,
        path: &Path,
        name: &str,
        params: &AdapterMergeParams,
    ) -> Result<()>;

    /// Loads an auxiliary adapter onto an already merged model
    fn load_adapter(&self, model: &mut Self::Model, path: &Path, name: &str) -> Result<()>;

    /// Disables every merged adapter and unwraps the base model
    fn disable_adapters(&self, model: &mut Self::Model) -> Result<()>;

    /// Reads a weights file
    fn load_state_dict(&self, path: &Path) -> Result<StateDict<Self::Tensor>>;

    /// Loads weights into the prefix encoder submodule
    fn load_prefix_encoder(&self, model: &mut Self::Model, state: StateDict<Self::Tensor>) -> Result<()>;

    /// Converts the prefix encoder to float32
    fn prefix_encoder_to_float(&self, model: &mut Self::Model) -> Result<()>;

    /// Switches the model to evaluation mode
    fn eval(&self, model: &mut Self::Model) -> Result<()>;
}
