//! Configuration manager
//!
//! Layers built-in defaults, an optional settings file and `LLM_LOADER__*`
//! environment variables into a validated `LoaderSettings`.

use std::path::{Path, PathBuf};
use config::{Config, Environment, File};
use tracing::{debug, info};

use common::error::{Error, Result};

use crate::settings::LoaderSettings;

/// Environment prefix for overrides, e.g. `LLM_LOADER__LOAD_IN_8BIT=true`
pub const ENV_PREFIX: &str = "LLM_LOADER";

/// Configuration manager for the loader
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Effective settings
    settings: LoaderSettings,

    /// File the settings were read from, if any
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Loads settings from `path` (or the default location when it exists)
    /// and the environment
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let source_path = path
            .map(Path::to_path_buf)
            .or_else(|| Self::default_config_path().filter(|p| p.exists()));

        let mut builder = Config::builder();

        if let Some(path) = &source_path {
            info!("Loading loader configuration from {}", path.display());
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("gpu_memory")
                .with_list_parse_key("lora")
                .try_parsing(true),
        );

        let settings: LoaderSettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;

        debug!(model = %settings.model, "Configuration loaded");

        Ok(Self {
            settings,
            source_path,
        })
    }

    /// Wraps already-built settings
    pub fn from_settings(settings: LoaderSettings) -> Self {
        Self {
            settings,
            source_path: None,
        }
    }

    /// Default settings file: `<config dir>/llm-loader/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("llm-loader").join("config.toml"))
    }

    /// Effective settings
    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// Mutable settings, for command-line overrides
    pub fn settings_mut(&mut self) -> &mut LoaderSettings {
        &mut self.settings
    }

    /// File the settings were read from
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Validates and returns the settings
    pub fn validated(&self) -> Result<&LoaderSettings> {
        self.settings.validate()?;
        Ok(&self.settings)
    }

    /// Renders the effective settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.settings).map_err(|e| Error::Internal(e.to_string()))
    }
}
