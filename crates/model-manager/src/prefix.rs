//! Prefix tuning support
//!
//! A prefix-tuning directory holds a `config.json` with the prefix length and
//! projection flag, and a weights file whose prefix-encoder tensors are keyed
//! under the full model path. Both halves are optional features: callers run
//! them through [`recover_auxiliary`](crate::recovery::recover_auxiliary).

use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::error::{Error, Result};

use crate::backend::{ModelConfig, StateDict};

/// Configuration file of a prefix-tuning directory
pub const PREFIX_CONFIG_FILE: &str = "config.json";

/// Weights file of a prefix-tuning directory
pub const PREFIX_WEIGHTS_FILE: &str = "pytorch_model.bin";

/// Key prefix of prefix-encoder tensors in the saved weights
pub const PREFIX_ENCODER_KEY: &str = "transformer.prefix_encoder.";

/// Feature name used for configuration failures
pub const PREFIX_CONFIG_FEATURE: &str = "prefix-tuning config";

/// Feature name used for weight injection failures
pub const PREFIX_WEIGHTS_FEATURE: &str = "prefix-tuning weights";

/// Prefix settings merged into the model configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixConfig {
    /// Prefix length
    pub pre_seq_len: usize,
    /// MLP projection of the prefix
    #[serde(default)]
    pub prefix_projection: bool,
}

impl PrefixConfig {
    /// Copies the prefix settings into a model configuration
    pub fn apply_to(&self, config: &mut ModelConfig) {
        config.pre_seq_len = Some(self.pre_seq_len);
        config.prefix_projection = self.prefix_projection;
    }
}

/// Reads `config.json` from a prefix-tuning directory
pub fn load_prefix_config(dir: &Path) -> Result<PrefixConfig> {
    if dir.as_os_str().is_empty() {
        return Err(Error::auxiliary(PREFIX_CONFIG_FEATURE, "no prefix-tuning directory configured"));
    }
    let path = dir.join(PREFIX_CONFIG_FILE);
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::auxiliary(PREFIX_CONFIG_FEATURE, format!("{}: {}", path.display(), e)))?;
    let config: PrefixConfig = serde_json::from_str(&raw)
        .map_err(|e| Error::auxiliary(PREFIX_CONFIG_FEATURE, format!("{}: {}", path.display(), e)))?;

    if config.pre_seq_len == 0 {
        return Err(Error::auxiliary(PREFIX_CONFIG_FEATURE, "pre_seq_len must be positive"));
    }

    debug!(
        pre_seq_len = config.pre_seq_len,
        prefix_projection = config.prefix_projection,
        "Loaded prefix-tuning config"
    );
    Ok(config)
}

/// Keeps only prefix-encoder tensors, re-keyed relative to the encoder
pub fn strip_prefix_keys<T>(state: StateDict<T>) -> StateDict<T> {
    state
        .into_iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(PREFIX_ENCODER_KEY)
                .map(|rest| (rest.to_string(), tensor))
        })
        .collect()
}
