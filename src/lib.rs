//! Main integration module for the LLM loader
//!
//! `LoaderService` ties the configuration manager, hardware detection and the
//! lifecycle controller together behind a small synchronous API. The caller
//! owns the service and serializes access to it.

use serde::Serialize;
use tracing::{debug, info};

use common::error::Result;
use common::types::LifecycleState;
use hardware_profiler::HardwareCapabilities;
use loader_config::{ConfigManager, LoaderSettings};
use model_manager::{HandleSummary, LoadWarning, ModelBackend, ModelLoader, Selection};

pub use common;
pub use hardware_profiler;
pub use loader_config;
pub use logging;
pub use model_manager;
pub use resource_manager;

/// Snapshot of the service for status reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    /// Lifecycle state
    pub state: LifecycleState,

    /// Loaded model, if any
    pub model: Option<HandleSummary>,

    /// Recoveries taken by the most recent reload
    pub warnings: Vec<LoadWarning>,
}

/// Model loading service
pub struct LoaderService<B: ModelBackend> {
    /// Configuration manager
    config: ConfigManager,

    /// Lifecycle controller
    loader: ModelLoader<B>,
}

impl<B: ModelBackend> LoaderService<B> {
    /// Creates a service with nothing loaded
    pub fn new(config: ConfigManager, backend: B) -> Self {
        info!("Initializing LLM loader service");
        Self {
            config,
            loader: ModelLoader::new(backend),
        }
    }

    /// Configuration manager
    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    /// Effective settings
    pub fn settings(&self) -> &LoaderSettings {
        self.config.settings()
    }

    /// Mutable settings, picked up by the next `reload`
    pub fn settings_mut(&mut self) -> &mut LoaderSettings {
        self.config.settings_mut()
    }

    /// Lifecycle controller
    pub fn loader(&self) -> &ModelLoader<B> {
        &self.loader
    }

    /// Current hardware snapshot as seen through the backend
    pub fn hardware(&self) -> HardwareCapabilities {
        HardwareCapabilities::detect(self.loader.backend())
    }

    /// Plan a reload would use, without loading weights
    pub fn plan(&self) -> Result<Selection> {
        self.loader.plan(self.config.settings())
    }

    /// Replaces the loaded model with one built from the current settings.
    /// Invalid settings still unload the current model.
    pub fn reload(&mut self) -> Result<HandleSummary> {
        let handle = self.loader.reload(self.config.settings())?;
        Ok(handle.summary())
    }

    /// Releases the loaded model
    pub fn unload(&mut self) {
        self.loader.unload();
    }

    /// Moves the loaded model to `desired` adapters.
    ///
    /// On success the settings are updated so that a later reload attaches
    /// the same adapters.
    pub fn apply_adapters(&mut self, desired: &[String]) -> Result<Vec<String>> {
        let names = self.loader.apply_adapters(desired)?.names().to_vec();
        debug!(adapters = ?names, "Recording adapters in settings");
        self.config.settings_mut().lora = names.clone();
        Ok(names)
    }

    /// Lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.loader.state()
    }

    /// Loaded model summary
    pub fn summary(&self) -> Option<HandleSummary> {
        self.loader.handle().map(|handle| handle.summary())
    }

    /// Status snapshot
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.state(),
            model: self.summary(),
            warnings: self.loader.warnings().to_vec(),
        }
    }
}
