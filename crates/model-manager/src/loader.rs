//! Model loader implementation
//!
//! This module provides the lifecycle controller. It owns the single model
//! handle and is the only place state transitions happen:
//!
//! ```text
//! EMPTY -> LOADING -> READY -> UNLOADING -> EMPTY
//! ```
//!
//! `reload` always unloads first, so repeated reloads never stack
//! allocations. A reload that fails at any point after `LOADING` drops what
//! it built, reclaims the backend cache and reports `EMPTY`.

use std::path::Path;
use std::time::Instant;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::error::{Error, Result};
use common::models::{AdapterSet, Device, DeviceMapping, LoadPlan, LoadStrategy, ModelSource};
use common::types::{CheckpointFormat, LifecycleState, ModelClass, ModelFamily};
use common::utils::measure_execution_time;
use hardware_profiler::HardwareCapabilities;
use loader_config::LoaderSettings;

use crate::adapters::{self, reconcile, MergeContext};
use crate::backend::{ModelBackend, ModelConfig, SpecialTokenIds};
use crate::format::detect_format;
use crate::handle::{ModelHandle, Placement};
use crate::precision::{select, LoadFlags, ModelProfile, Selection};
use crate::prefix::{
    load_prefix_config, strip_prefix_keys, PrefixConfig, PREFIX_CONFIG_FEATURE, PREFIX_ENCODER_KEY,
    PREFIX_WEIGHTS_FEATURE, PREFIX_WEIGHTS_FILE,
};
use crate::recovery::{recover_auxiliary, LoadWarning};

/// Everything decided before weights are touched
struct Prepared {
    source: ModelSource,
    config: ModelConfig,
    plan: LoadPlan,
    prefix: Option<PrefixConfig>,
}

/// Lifecycle controller for one model
pub struct ModelLoader<B: ModelBackend> {
    /// Model-serving backend
    backend: B,

    /// Lifecycle state
    state: LifecycleState,

    /// Loaded model, present exactly when the state is READY
    handle: Option<ModelHandle<B::Model, B::Tokenizer>>,

    /// Settings the current handle was loaded with
    settings: Option<LoaderSettings>,

    /// Recoveries taken by the most recent reload
    warnings: Vec<LoadWarning>,
}

impl<B: ModelBackend> ModelLoader<B> {
    /// Creates an empty loader
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: LifecycleState::Empty,
            handle: None,
            settings: None,
            warnings: Vec::new(),
        }
    }

    /// Backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable backend access
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns true if a model is loaded
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Loaded model, if any
    pub fn handle(&self) -> Option<&ModelHandle<B::Model, B::Tokenizer>> {
        self.handle.as_ref()
    }

    /// Recoveries taken by the most recent reload
    pub fn warnings(&self) -> &[LoadWarning] {
        &self.warnings
    }

    /// Computes the plan a reload with `settings` would use, without loading
    /// weights. Skeleton inference still runs when the plan needs it.
    pub fn plan(&self, settings: &LoaderSettings) -> Result<Selection> {
        let mut warnings = Vec::new();
        let prepared = self.prepare(settings, &mut warnings)?;
        Ok(Selection {
            plan: prepared.plan,
            warnings,
        })
    }

    /// Unloads the current model, then loads one according to `settings`
    pub fn reload(&mut self, settings: &LoaderSettings) -> Result<&ModelHandle<B::Model, B::Tokenizer>> {
        self.unload();

        info!(model = %settings.model, "Reloading model");
        self.enter(LifecycleState::Loading);

        let mut warnings = Vec::new();
        let result = self.materialize(settings, &mut warnings);
        self.warnings = warnings;

        match result {
            Ok(handle) => {
                info!(
                    model = %handle.name,
                    dtype = %handle.dtype,
                    placement = %handle.placement,
                    adapters = handle.adapters.len(),
                    elapsed_ms = handle.load_time.as_millis() as u64,
                    "Loaded the model in {:.2} seconds",
                    handle.load_time.as_secs_f64()
                );
                self.settings = Some(settings.clone());
                self.enter(LifecycleState::Ready);
                Ok(&*self.handle.insert(handle))
            }
            Err(err) => {
                error!(model = %settings.model, "Failed to load model: {}", err);
                self.reclaim();
                self.enter(LifecycleState::Empty);
                Err(err)
            }
        }
    }

    /// Drops the model and tokenizer and reclaims the backend cache.
    /// Safe to call in any state; calling it twice is the same as once.
    pub fn unload(&mut self) {
        self.enter(LifecycleState::Unloading);

        if let Some(handle) = self.handle.take() {
            info!(model = %handle.name, load_id = %handle.load_id, "Unloading model");
        }
        self.settings = None;
        self.reclaim();

        self.enter(LifecycleState::Empty);
    }

    /// Moves the loaded model to the `desired` adapter list.
    ///
    /// A failed merge leaves the model in an unknown adapter state, so the
    /// model is unloaded and the error returned.
    pub fn apply_adapters(&mut self, desired: &[String]) -> Result<&AdapterSet> {
        let outcome = {
            let (handle, settings) = match (self.handle.as_mut(), self.settings.as_ref()) {
                (Some(handle), Some(settings)) if self.state.is_ready() => (handle, settings),
                _ => {
                    return Err(Error::InvalidState(format!(
                        "Adapters can only be applied to a loaded model (state {})",
                        self.state
                    )))
                }
            };

            if handle.plan.format.is_legacy() {
                return Err(Error::Adapter(
                    "Legacy binary checkpoints do not support adapters".to_string(),
                ));
            }
            if !desired.is_empty() && settings.lora_dir.as_os_str().is_empty() {
                return Err(Error::Config("Adapters requested but lora_dir is empty".to_string()));
            }

            let reconciliation = reconcile(&handle.adapters, desired);
            info!(
                strategy = %reconciliation.strategy,
                add = ?reconciliation.to_add,
                remove = ?reconciliation.to_remove,
                "Reconciling adapters"
            );

            let context = merge_context(&settings.lora_dir, &handle.plan);
            let result = adapters::apply(
                &self.backend,
                &mut handle.model,
                &handle.tokenizer,
                &reconciliation,
                &context,
            );
            if result.is_ok() {
                handle.placement = placement_of(&self.backend, &handle.model, &handle.plan);
                handle.adapters = reconciliation.next;
            }
            result
        };

        if let Err(err) = outcome {
            error!("Adapter update failed, unloading the model: {}", err);
            self.unload();
            return Err(err);
        }

        self.handle
            .as_ref()
            .map(|handle| &handle.adapters)
            .ok_or_else(|| Error::Internal("Model handle missing after adapter update".to_string()))
    }

    fn enter(&mut self, next: LifecycleState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        info!("State transition: {} -> {}", self.state, next);
        self.state = next;
    }

    fn reclaim(&self) {
        if let Err(err) = self.backend.empty_cache() {
            warn!("Cache reclaim failed: {}", err);
        }
    }

    fn prepare(&self, settings: &LoaderSettings, warnings: &mut Vec<LoadWarning>) -> Result<Prepared> {
        settings.validate()?;

        let source = settings.source();
        let hardware = HardwareCapabilities::detect(&self.backend);
        let format = detect_format(&settings.checkpoint_dir())?;
        let flags = LoadFlags::try_from(settings)?;
        let class = ModelClass::for_model_name(&settings.model);

        if format.is_legacy() {
            let profile = ModelProfile {
                layer_count: 0,
                class,
                family: ModelFamily::Standard,
                format,
            };
            let selection = select(&flags, &hardware, &profile)?;
            return Ok(Prepared {
                source,
                config: ModelConfig::with_layers(0),
                plan: selection.plan,
                prefix: None,
            });
        }

        let mut config = self.backend.load_config(&source, settings.trust_remote_code)?;

        let prefix = if settings.use_ptuning_v2 {
            recover_auxiliary(
                PREFIX_CONFIG_FEATURE,
                load_prefix_config(&settings.ptuning_dir),
                warnings,
            )
        } else {
            None
        };
        if let Some(prefix) = &prefix {
            prefix.apply_to(&mut config);
        }

        let profile = ModelProfile {
            layer_count: config.num_layers,
            class,
            family: config.family(),
            format,
        };
        let selection = select(&flags, &hardware, &profile)?;
        warnings.extend(selection.warnings);

        let mut plan = selection.plan;
        if plan.requires_skeleton {
            self.infer_placement(&config, &mut plan)?;
        }
        plan.validate()?;

        debug!(strategy = ?plan.strategy, dtype = %plan.dtype, "Load plan ready");
        Ok(Prepared {
            source,
            config,
            plan,
            prefix,
        })
    }

    fn infer_placement(&self, config: &ModelConfig, plan: &mut LoadPlan) -> Result<()> {
        let max_memory = plan.max_memory.clone().ok_or_else(|| {
            Error::Config("Device map inference requires memory caps".to_string())
        })?;

        info!("Inferring device map against an uninitialized model");
        let (map, elapsed) = measure_execution_time(|| {
            let skeleton = self.backend.from_config(config, plan.class)?;
            let no_split = self.backend.no_split_modules(&skeleton);
            self.backend
                .infer_device_map(&skeleton, plan.dtype, &max_memory, &no_split)
        })?;

        if map.is_empty() {
            return Err(Error::Config("Device map inference produced an empty map".to_string()));
        }

        debug!(
            segments = map.len(),
            devices = ?map.accelerators(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Inferred device map"
        );
        plan.device_mapping = DeviceMapping::Explicit(map);
        Ok(())
    }

    fn materialize(
        &self,
        settings: &LoaderSettings,
        warnings: &mut Vec<LoadWarning>,
    ) -> Result<ModelHandle<B::Model, B::Tokenizer>> {
        let started = Instant::now();
        let Prepared {
            source,
            config,
            plan,
            prefix,
        } = self.prepare(settings, warnings)?;

        if let CheckpointFormat::LegacyBinary { weights } = &plan.format {
            if !settings.lora.is_empty() {
                warn!("Adapters are not supported for legacy binary checkpoints, ignoring {:?}", settings.lora);
            }
            let (model, tokenizer) = self.backend.load_legacy(weights)?;
            return Ok(self.build_handle(settings, model, tokenizer, plan, AdapterSet::empty(), false, started));
        }

        let mut model = self.instantiate(&source, &config, &plan, settings.trust_remote_code)?;

        let mut tokenizer = self
            .backend
            .load_tokenizer(&source, plan.family.into(), settings.trust_remote_code)?;
        if plan.family == ModelFamily::Llama {
            if let Err(err) = self
                .backend
                .set_special_token_ids(&mut tokenizer, SpecialTokenIds::LLAMA)
            {
                warn!("Failed to set Llama special token ids: {}", err);
            }
        }

        let mut adapter_set = AdapterSet::empty();
        if !settings.lora.is_empty() {
            let reconciliation = reconcile(&adapter_set, &settings.lora);
            let context = merge_context(&settings.lora_dir, &plan);
            adapters::apply(&self.backend, &mut model, &tokenizer, &reconciliation, &context)?;
            adapter_set = reconciliation.next;
        }

        // the prefix encoder only exists once the prefix config was applied
        let prefix_tuning = prefix.is_some()
            && recover_auxiliary(
                PREFIX_WEIGHTS_FEATURE,
                self.inject_prefix(&mut model, &settings.ptuning_dir),
                warnings,
            )
            .is_some();

        self.backend.eval(&mut model)?;

        Ok(self.build_handle(settings, model, tokenizer, plan, adapter_set, prefix_tuning, started))
    }

    fn instantiate(
        &self,
        source: &ModelSource,
        config: &ModelConfig,
        plan: &LoadPlan,
        trust_remote_code: bool,
    ) -> Result<B::Model> {
        info!(
            source = %source,
            strategy = ?plan.strategy,
            dtype = %plan.dtype,
            "Materializing model"
        );

        match plan.strategy {
            LoadStrategy::SingleDevice => {
                let mut model = self.backend.from_pretrained(source, config, plan, trust_remote_code)?;
                let device = plan.target_devices.first().copied().unwrap_or(Device::Cpu);
                self.backend.to_device(&mut model, device)?;
                Ok(model)
            }
            LoadStrategy::MultiDeviceDispatch => {
                let map = plan
                    .device_mapping
                    .explicit()
                    .ok_or_else(|| Error::Config("Multi-device dispatch requires a device map".to_string()))?;
                // weights load unplaced, the map is applied by dispatch
                let unplaced = LoadPlan {
                    device_mapping: DeviceMapping::None,
                    ..plan.clone()
                };
                let mut model = self.backend.from_pretrained(source, config, &unplaced, trust_remote_code)?;
                self.backend.dispatch(&mut model, map)?;
                Ok(model)
            }
            _ => self.backend.from_pretrained(source, config, plan, trust_remote_code),
        }
    }

    fn inject_prefix(&self, model: &mut B::Model, dir: &Path) -> Result<()> {
        let state = self.backend.load_state_dict(&dir.join(PREFIX_WEIGHTS_FILE))?;
        let state = strip_prefix_keys(state);
        if state.is_empty() {
            return Err(Error::auxiliary(
                PREFIX_WEIGHTS_FEATURE,
                format!("no {}* tensors in {}", PREFIX_ENCODER_KEY, PREFIX_WEIGHTS_FILE),
            ));
        }

        self.backend.load_prefix_encoder(model, state)?;
        self.backend.prefix_encoder_to_float(model)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_handle(
        &self,
        settings: &LoaderSettings,
        model: B::Model,
        tokenizer: B::Tokenizer,
        plan: LoadPlan,
        adapters: AdapterSet,
        prefix_tuning: bool,
        started: Instant,
    ) -> ModelHandle<B::Model, B::Tokenizer> {
        let placement = placement_of(&self.backend, &model, &plan);
        ModelHandle {
            dtype: self.backend.model_dtype(&model),
            quantization: plan.quantization,
            name: settings.model.clone(),
            model,
            tokenizer,
            placement,
            plan,
            adapters,
            prefix_tuning,
            load_id: Uuid::new_v4(),
            loaded_at: Utc::now(),
            load_time: started.elapsed(),
        }
    }
}

fn merge_context<'a>(lora_dir: &'a Path, plan: &LoadPlan) -> MergeContext<'a> {
    MergeContext {
        lora_dir,
        cpu: plan.strategy == LoadStrategy::Cpu,
        quantized: plan.dtype.is_quantized(),
        rehome_to: plan.target_devices.first().copied().unwrap_or(Device::Cpu),
    }
}

fn placement_of<B: ModelBackend>(backend: &B, model: &B::Model, plan: &LoadPlan) -> Placement {
    match backend.model_device_map(model) {
        Some(map) => Placement::Mapped(map),
        None => Placement::Single(plan.target_devices.first().copied().unwrap_or(Device::Cpu)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use common::types::DType;
    use common::utils::{GIB, MIB};
    use hardware_profiler::{AcceleratorBackend, AcceleratorInfo};

    use crate::dry_run::{BackendCall, DryRunBackend};

    fn gpus(count: usize, bytes: u64) -> DryRunBackend {
        DryRunBackend::new().with_accelerators((0..count).map(|i| AcceleratorInfo::cuda(i, bytes)).collect())
    }

    /// Settings that take the simple accelerator path
    fn settings() -> LoaderSettings {
        let mut settings = LoaderSettings::for_model("chatglm-6b");
        settings.auto_devices = false;
        settings
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn adapter_root(list: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in list {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn test_unload_is_idempotent() {
        let mut loader = ModelLoader::new(DryRunBackend::new());
        loader.unload();
        loader.unload();

        assert_eq!(loader.state(), LifecycleState::Empty);
        assert!(loader.handle().is_none());
        assert_eq!(
            loader.backend().calls(),
            vec![BackendCall::EmptyCache, BackendCall::EmptyCache]
        );
    }

    #[test]
    fn test_single_gpu_reload() {
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&settings()).unwrap();

        assert_eq!(handle.dtype, DType::Float16);
        assert_eq!(handle.placement, Placement::Single(Device::Cuda(0)));
        assert_eq!(handle.plan.class, ModelClass::Base);
        assert!(handle.model.eval);
        assert_eq!(loader.state(), LifecycleState::Ready);

        let calls = loader.backend().calls();
        assert_eq!(calls[0], BackendCall::EmptyCache);
        assert!(calls.contains(&BackendCall::ToDevice(Device::Cuda(0))));
        assert_eq!(calls.last(), Some(&BackendCall::Eval));
    }

    #[test]
    fn test_reload_round_trip_is_equivalent() {
        let mut loader = ModelLoader::new(gpus(2, 24 * GIB));
        let first = loader.reload(&settings()).unwrap();
        let (summary, first_id) = (first.summary(), first.load_id);

        let second = loader.reload(&settings()).unwrap();
        assert_eq!(second.summary(), summary);
        assert_ne!(second.load_id, first_id);
    }

    #[test]
    fn test_two_gpus_dispatch_contiguous_split() {
        let mut loader = ModelLoader::new(gpus(2, 24 * GIB));
        let handle = loader.reload(&settings()).unwrap();

        let Placement::Mapped(map) = &handle.placement else {
            panic!("expected a device map, got {}", handle.placement);
        };
        assert_eq!(map.layers_on(0), (0..13).collect::<Vec<_>>());
        assert_eq!(map.layers_on(1), (13..28).collect::<Vec<_>>());

        let calls = loader.backend().calls();
        assert!(calls.contains(&BackendCall::FromPretrained { dtype: DType::Float16, device_map: false }));
        assert!(calls.contains(&BackendCall::Dispatch));
    }

    #[test]
    fn test_eight_bit_skeleton_inference() {
        let mut loader = ModelLoader::new(gpus(1, 8000 * MIB));
        let mut settings = settings();
        settings.load_in_8bit = true;
        settings.auto_devices = true;

        let handle = loader.reload(&settings).unwrap();
        assert_eq!(handle.dtype, DType::Int8);
        assert!(matches!(handle.placement, Placement::Mapped(_)));
        assert!(handle.plan.requires_skeleton);
        assert!(handle.plan.device_mapping.explicit().is_some());

        let calls = loader.backend().calls();
        let skeleton = calls.iter().position(|c| *c == BackendCall::FromConfig).unwrap();
        let infer = calls
            .iter()
            .position(|c| *c == BackendCall::InferDeviceMap(DType::Int8))
            .unwrap();
        let load = calls
            .iter()
            .position(|c| matches!(c, BackendCall::FromPretrained { dtype: DType::Int8, device_map: true }))
            .unwrap();
        assert!(skeleton < infer && infer < load);
    }

    #[test]
    fn test_eight_bit_without_resolvable_caps_is_fatal() {
        let backend = DryRunBackend::new().with_accelerators(vec![AcceleratorInfo {
            index: 0,
            name: "cuda:0".to_string(),
            backend: AcceleratorBackend::Cuda,
            total_memory_bytes: None,
        }]);
        let mut loader = ModelLoader::new(backend);
        let mut settings = settings();
        settings.load_in_8bit = true;
        settings.auto_devices = true;

        let err = loader.reload(&settings).unwrap_err();
        assert!(err.is_config());
        assert_eq!(loader.state(), LifecycleState::Empty);
        assert!(loader.handle().is_none());
        assert!(!loader
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::FromPretrained { .. })));
    }

    #[test]
    fn test_failed_reload_leaves_empty_and_recovers() {
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        loader.reload(&settings()).unwrap();

        *loader.backend_mut() = gpus(1, 24 * GIB).failing_on("from_pretrained");
        assert!(loader.reload(&settings()).is_err());
        assert_eq!(loader.state(), LifecycleState::Empty);
        assert!(loader.handle().is_none());

        loader.backend_mut().recover("from_pretrained");
        loader.reload(&settings()).unwrap();
        assert!(loader.is_ready());
    }

    #[test]
    fn test_invalid_settings_fail_without_loading() {
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let err = loader.reload(&LoaderSettings::default()).unwrap_err();
        assert!(err.is_config());
        assert_eq!(loader.state(), LifecycleState::Empty);
    }

    #[test]
    fn test_cpu_fallback_is_recorded() {
        let mut loader = ModelLoader::new(DryRunBackend::new());
        let handle = loader.reload(&settings()).unwrap();

        assert_eq!(handle.dtype, DType::Float32);
        assert_eq!(handle.placement, Placement::Single(Device::Cpu));
        assert_eq!(loader.warnings(), &[LoadWarning::CpuFallback]);
    }

    #[test]
    fn test_cache_reclaim_failure_is_not_fatal() {
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB).failing_on("empty_cache"));
        loader.unload();
        loader.reload(&settings()).unwrap();
        loader.unload();
        assert_eq!(loader.state(), LifecycleState::Empty);
    }

    fn ptuning_dir(config: Option<&str>, weights: Option<&str>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        if let Some(config) = config {
            fs::write(dir.path().join("config.json"), config).unwrap();
        }
        if let Some(weights) = weights {
            fs::write(dir.path().join(PREFIX_WEIGHTS_FILE), weights).unwrap();
        }
        dir
    }

    fn with_ptuning(dir: &Path) -> LoaderSettings {
        let mut settings = settings();
        settings.use_ptuning_v2 = true;
        settings.ptuning_dir = dir.to_path_buf();
        settings
    }

    #[test]
    fn test_prefix_tuning_injection() {
        let dir = ptuning_dir(
            Some(r#"{"pre_seq_len": 128, "prefix_projection": false}"#),
            Some(r#"{"transformer.prefix_encoder.embedding.weight": [0.1, 0.2], "lm_head.weight": [1.0]}"#),
        );
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&with_ptuning(dir.path())).unwrap();

        assert!(handle.prefix_tuning);
        assert_eq!(handle.dtype, DType::Float16);
        let encoder = handle.model.prefix_encoder.as_ref().unwrap();
        assert_eq!(encoder.keys, vec!["embedding.weight".to_string()]);
        assert_eq!(encoder.dtype, DType::Float32);
        assert!(loader.warnings().is_empty());
    }

    #[test]
    fn test_missing_prefix_config_disables_feature() {
        let dir = ptuning_dir(None, None);
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&with_ptuning(dir.path())).unwrap();

        assert!(!handle.prefix_tuning);
        assert!(loader.warnings()[0].disabled(PREFIX_CONFIG_FEATURE));
        assert!(!loader.backend().calls().contains(&BackendCall::LoadStateDict));
        assert!(loader.is_ready());
    }

    #[test]
    fn test_prefix_tuning_without_directory_disables_feature() {
        let mut settings = settings();
        settings.use_ptuning_v2 = true;
        settings.ptuning_dir = PathBuf::new();

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&settings).unwrap();
        assert!(!handle.prefix_tuning);
        assert_eq!(loader.warnings().len(), 1);
        assert!(loader.warnings()[0].disabled(PREFIX_CONFIG_FEATURE));
        assert!(loader.is_ready());
    }

    #[test]
    fn test_default_settings_take_capped_placement() {
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&LoaderSettings::for_model("chatglm-6b")).unwrap();

        assert_eq!(handle.plan.strategy, LoadStrategy::MemoryCapped);
        assert_eq!(handle.plan.max_memory.as_ref().unwrap().cpu.as_str(), "99GiB");
        assert!(loader.warnings().is_empty());
    }

    #[test]
    fn test_bad_prefix_weights_disable_feature() {
        let dir = ptuning_dir(
            Some(r#"{"pre_seq_len": 8}"#),
            Some(r#"{"lm_head.weight": [1.0]}"#),
        );
        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&with_ptuning(dir.path())).unwrap();

        assert!(!handle.prefix_tuning);
        assert!(handle.model.prefix_encoder.is_none());
        assert_eq!(loader.warnings().len(), 1);
        assert!(loader.warnings()[0].disabled(PREFIX_WEIGHTS_FEATURE));
    }

    #[test]
    fn test_llama_tokenizer_override() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("llama-7b");
        fs::create_dir(&model_dir).unwrap();
        fs::write(model_dir.join("config.json"), r#"{"num_hidden_layers": 32, "model_type": "llama"}"#).unwrap();

        let mut settings = LoaderSettings::for_model("llama-7b");
        settings.auto_devices = false;
        settings.no_remote_model = true;
        settings.model_dir = dir.path().to_path_buf();

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&settings).unwrap();
        assert_eq!(handle.plan.family, ModelFamily::Llama);
        assert_eq!(handle.plan.class, ModelClass::CausalLm);
        assert_eq!(handle.tokenizer.special_tokens, Some(SpecialTokenIds::LLAMA));

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB).failing_on("set_special_token_ids"));
        let handle = loader.reload(&settings).unwrap();
        assert!(handle.tokenizer.special_tokens.is_none());
    }

    #[test]
    fn test_legacy_checkpoint_uses_legacy_loader() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("alpaca-ggml");
        fs::create_dir(&model_dir).unwrap();
        fs::write(model_dir.join("ggml-model-q4_0.bin"), b"weights").unwrap();

        let mut settings = LoaderSettings::for_model("alpaca-ggml");
        settings.no_remote_model = true;
        settings.model_dir = dir.path().to_path_buf();
        settings.cpu = true;

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&settings).unwrap();
        assert_eq!(handle.plan.strategy, LoadStrategy::Legacy);

        let calls = loader.backend().calls();
        assert!(calls.contains(&BackendCall::LoadLegacy(model_dir.join("ggml-model-q4_0.bin"))));
        assert!(!calls.iter().any(|c| matches!(c, BackendCall::LoadConfig(_))));

        let err = loader.apply_adapters(&names(&["A"])).unwrap_err();
        assert!(err.is_adapter());
        assert!(loader.is_ready());
    }

    #[test]
    fn test_legacy_weights_win_over_remote_source() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("alpaca-ggml");
        fs::create_dir(&model_dir).unwrap();
        fs::write(model_dir.join("ggml-model-q4_0.bin"), b"weights").unwrap();

        let mut settings = LoaderSettings::for_model("alpaca-ggml");
        settings.model_dir = dir.path().to_path_buf();
        assert!(matches!(settings.source(), ModelSource::Remote(_)));

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&settings).unwrap();
        assert_eq!(handle.plan.strategy, LoadStrategy::Legacy);
        assert!(loader
            .backend()
            .calls()
            .contains(&BackendCall::LoadLegacy(model_dir.join("ggml-model-q4_0.bin"))));
    }

    #[test]
    fn test_adapter_at_load_time() {
        let root = adapter_root(&["alpaca"]);
        let mut settings = settings();
        settings.lora = names(&["alpaca"]);
        settings.lora_dir = root.path().to_path_buf();

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let handle = loader.reload(&settings).unwrap();
        assert_eq!(handle.adapters.names(), names(&["alpaca"]).as_slice());
        assert_eq!(handle.model.adapters, names(&["alpaca"]));
        assert_eq!(handle.placement, Placement::Single(Device::Cuda(0)));
    }

    #[test]
    fn test_failed_adapter_at_load_time_leaves_empty() {
        let root = adapter_root(&[]);
        let mut settings = settings();
        settings.lora = names(&["missing"]);
        settings.lora_dir = root.path().to_path_buf();

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        let err = loader.reload(&settings).unwrap_err();
        assert!(err.is_adapter());
        assert_eq!(loader.state(), LifecycleState::Empty);
    }

    #[test]
    fn test_apply_adapters_after_load() {
        let root = adapter_root(&["A", "B", "C"]);
        let mut settings = settings();
        settings.lora_dir = root.path().to_path_buf();

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        loader.reload(&settings).unwrap();

        let set = loader.apply_adapters(&names(&["A"])).unwrap();
        assert_eq!(set.names(), names(&["A"]).as_slice());

        let set = loader.apply_adapters(&names(&["A", "B"])).unwrap();
        assert_eq!(set.names(), names(&["A", "B"]).as_slice());
        assert!(set.last_diff().to_remove.is_empty());

        let set = loader.apply_adapters(&names(&["B", "C"])).unwrap();
        assert_eq!(set.names(), names(&["B", "C"]).as_slice());
        assert_eq!(set.last_diff().to_remove.len(), 1);

        let handle = loader.handle().unwrap();
        assert_eq!(handle.model.adapters, names(&["B", "C"]));
        assert_eq!(handle.placement, Placement::Single(Device::Cuda(0)));
    }

    #[test]
    fn test_failed_adapter_update_unloads() {
        let root = adapter_root(&["A"]);
        let mut settings = settings();
        settings.lora_dir = root.path().to_path_buf();

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        loader.reload(&settings).unwrap();

        let err = loader.apply_adapters(&names(&["A", "missing"])).unwrap_err();
        assert!(err.is_adapter());
        assert_eq!(loader.state(), LifecycleState::Empty);
        assert!(loader.handle().is_none());
    }

    #[test]
    fn test_apply_adapters_requires_loaded_model() {
        let mut loader = ModelLoader::new(DryRunBackend::new());
        let err = loader.apply_adapters(&names(&["A"])).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_plan_does_not_load_weights() {
        let loader = ModelLoader::new(gpus(2, 24 * GIB));
        let selection = loader.plan(&settings()).unwrap();

        assert_eq!(selection.plan.strategy, LoadStrategy::MultiDeviceDispatch);
        assert_eq!(loader.state(), LifecycleState::Empty);
        assert!(!loader
            .backend()
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::FromPretrained { .. })));
    }

    #[test]
    fn test_missing_local_model_is_not_found() {
        let mut settings = settings();
        settings.no_remote_model = true;
        settings.model_dir = PathBuf::from("/nonexistent/models");

        let mut loader = ModelLoader::new(gpus(1, 24 * GIB));
        assert!(loader.reload(&settings).unwrap_err().is_not_found());
        assert_eq!(loader.state(), LifecycleState::Empty);
    }
}
