//! Loader settings
//!
//! `LoaderSettings` is the configuration record supplied at construction. Every
//! field has a default so partial files and environment overrides compose.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::models::{DeviceMap, MemoryLimit, ModelSource};

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Directory for a daily rolling log file
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

/// Configuration record for the model loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSettings {
    /// Model name, or remote identifier
    pub model: String,
    /// Resolve the model under `model_dir` instead of remotely
    pub no_remote_model: bool,
    /// Root directory of local checkpoints
    pub model_dir: PathBuf,
    /// Adapters to attach at load time, base first
    pub lora: Vec<String>,
    /// Root directory of adapters
    pub lora_dir: PathBuf,
    /// Enable prefix tuning
    pub use_ptuning_v2: bool,
    /// Directory holding the prefix-tuning `config.json` and weights
    pub ptuning_dir: PathBuf,
    /// Force CPU execution
    pub cpu: bool,
    /// Per-accelerator memory overrides, bare numbers are GiB
    pub gpu_memory: Vec<String>,
    /// Host memory override
    pub cpu_memory: Option<String>,
    /// Let placement be inferred under an estimated memory cap
    pub auto_devices: bool,
    /// Load weights as 8-bit integers
    pub load_in_8bit: bool,
    /// Use bfloat16 instead of float16
    pub bf16: bool,
    /// Explicit segment placement
    pub device_map: Option<DeviceMap>,
    /// Allow checkpoints to run their own configuration code
    pub trust_remote_code: bool,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            no_remote_model: false,
            model_dir: PathBuf::new(),
            lora: Vec::new(),
            lora_dir: PathBuf::new(),
            use_ptuning_v2: false,
            ptuning_dir: PathBuf::new(),
            cpu: false,
            gpu_memory: Vec::new(),
            cpu_memory: None,
            auto_devices: true,
            load_in_8bit: false,
            bf16: false,
            device_map: None,
            trust_remote_code: true,
            logging: LoggingSettings::default(),
        }
    }
}

impl LoaderSettings {
    /// Settings for `model` with everything else defaulted
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Local checkpoint directory, scanned for legacy weights even when the
    /// model itself is resolved remotely
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_dir.join(&self.model)
    }

    /// Where the checkpoint is read from
    pub fn source(&self) -> ModelSource {
        if self.no_remote_model {
            ModelSource::Local(self.checkpoint_dir())
        } else {
            ModelSource::Remote(self.model.clone())
        }
    }

    /// Normalized per-accelerator memory overrides
    pub fn gpu_memory_limits(&self) -> Result<Vec<MemoryLimit>> {
        self.gpu_memory.iter().map(|raw| MemoryLimit::parse(raw)).collect()
    }

    /// Normalized host memory override
    pub fn cpu_memory_limit(&self) -> Result<Option<MemoryLimit>> {
        self.cpu_memory.as_deref().map(MemoryLimit::parse).transpose()
    }

    /// Checks that the settings describe a loadable model
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("No model specified".to_string()));
        }

        if self.no_remote_model && self.model_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "no_remote_model is set but model_dir is empty".to_string(),
            ));
        }

        if !self.lora.is_empty() && self.lora_dir.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "Adapters {:?} requested but lora_dir is empty",
                self.lora
            )));
        }

        self.gpu_memory_limits()
            .map_err(|e| Error::Config(format!("Invalid gpu_memory: {}", e)))?;
        self.cpu_memory_limit()
            .map_err(|e| Error::Config(format!("Invalid cpu_memory: {}", e)))?;

        Ok(())
    }
}
