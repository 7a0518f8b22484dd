use std::fs;
use std::io::Write;

use common::models::{Device, DeviceMap, DeviceSlot, LoadStrategy, OffloadTarget, Segment};
use common::types::{DType, LifecycleState};
use common::utils::GIB;
use hardware_profiler::AcceleratorInfo;
use llm_loader::LoaderService;
use loader_config::{ConfigManager, LoaderSettings};
use model_manager::prefix::PREFIX_CONFIG_FEATURE;
use model_manager::{BackendCall, DryRunBackend, LoadWarning, Placement};

fn backend(gpus: usize) -> DryRunBackend {
    DryRunBackend::new().with_accelerators((0..gpus).map(|i| AcceleratorInfo::cuda(i, 24 * GIB)).collect())
}

fn service_with(settings: LoaderSettings, backend: DryRunBackend) -> LoaderService<DryRunBackend> {
    LoaderService::new(ConfigManager::from_settings(settings), backend)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_repeated_reloads_do_not_stack() {
    let mut service = service_with(LoaderSettings::for_model("chatglm-6b"), backend(2));

    let first = service.reload().unwrap();
    let second = service.reload().unwrap();
    assert_eq!(first, second);

    // every reload reclaims before it materializes
    let calls = service.loader().backend().calls();
    let loads: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, BackendCall::FromPretrained { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(loads.len(), 2);
    assert!(calls[loads[0]..loads[1]].contains(&BackendCall::EmptyCache));
}

#[test]
fn test_unload_twice_from_ready() {
    let mut service = service_with(LoaderSettings::for_model("chatglm-6b"), backend(1));
    service.reload().unwrap();

    service.unload();
    service.unload();
    assert_eq!(service.state(), LifecycleState::Empty);
    assert!(service.summary().is_none());
}

#[test]
fn test_settings_file_drives_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loader.toml");
    let mut file = fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
model = "chatglm-6b"
bf16 = true
auto_devices = false
"#
    )
    .unwrap();

    let config = ConfigManager::new(Some(path.as_path())).unwrap();
    let mut service = LoaderService::new(config, backend(1));
    let summary = service.reload().unwrap();

    assert_eq!(summary.dtype, DType::BFloat16);
    assert_eq!(summary.strategy, LoadStrategy::SingleDevice);
}

#[test]
fn test_explicit_device_map_overrides_even_split() {
    let mut map = DeviceMap::new();
    map.insert(Segment::Embedding, DeviceSlot::Accelerator(0));
    map.insert(Segment::FinalNorm, DeviceSlot::Accelerator(0));
    map.insert(Segment::OutputHead, DeviceSlot::Accelerator(0));
    for layer in 0..28 {
        let device = if layer < 4 { 0 } else { 1 };
        map.insert(Segment::Layer(layer), DeviceSlot::Accelerator(device));
    }

    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.auto_devices = false;
    settings.device_map = Some(map.clone());
    let mut service = service_with(settings, backend(2));

    let summary = service.reload().unwrap();
    assert_eq!(summary.strategy, LoadStrategy::MultiDeviceDispatch);
    assert_eq!(summary.placement, Placement::Mapped(map));
}

#[test]
fn test_explicit_map_must_keep_embedding_on_first_device() {
    let mut service = service_with(LoaderSettings::for_model("chatglm-6b"), backend(2));
    service.reload().unwrap();

    let mut map = DeviceMap::new();
    map.insert(Segment::Embedding, DeviceSlot::Accelerator(1));
    map.insert(Segment::OutputHead, DeviceSlot::Accelerator(0));
    map.insert(Segment::Layer(0), DeviceSlot::Accelerator(1));
    service.settings_mut().auto_devices = false;
    service.settings_mut().device_map = Some(map);

    assert!(service.reload().unwrap_err().is_config());
    assert_eq!(service.state(), LifecycleState::Empty);
    // only the first, valid reload materialized weights
    let loads = service
        .loader()
        .backend()
        .calls()
        .iter()
        .filter(|c| matches!(c, BackendCall::FromPretrained { .. }))
        .count();
    assert_eq!(loads, 1);
}

#[test]
fn test_host_cap_alone_is_not_a_single_device_load() {
    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.auto_devices = false;
    settings.cpu_memory = Some("32".to_string());
    let mut service = service_with(settings, backend(1));

    let summary = service.reload().unwrap();
    assert_eq!(summary.strategy, LoadStrategy::MemoryCapped);
    assert_eq!(service.status().warnings, vec![LoadWarning::MemoryCapsUnavailable]);
}

#[test]
fn test_memory_caps_spill_to_cpu() {
    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.gpu_memory = names(&["2"]);
    let backend = backend(1).with_params_per_layer(100_000_000);
    let mut service = service_with(settings, backend);

    let summary = service.reload().unwrap();
    assert_eq!(summary.strategy, LoadStrategy::MemoryCapped);

    let Placement::Mapped(map) = summary.placement else {
        panic!("expected a device map");
    };
    assert_eq!(map.get(&Segment::Embedding), Some(DeviceSlot::Accelerator(0)));
    assert_eq!(map.get(&Segment::Layer(27)), Some(DeviceSlot::Offload(OffloadTarget::Cpu)));
}

#[test]
fn test_eight_bit_on_mps_only_host_is_fatal() {
    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.load_in_8bit = true;
    settings.auto_devices = true;
    let mut service = service_with(settings, DryRunBackend::new().with_accelerators(vec![AcceleratorInfo::mps()]));

    assert!(service.reload().unwrap_err().is_config());
    assert_eq!(service.state(), LifecycleState::Empty);
}

#[test]
fn test_mps_only_host_loads_in_float32() {
    let mut service = service_with(
        LoaderSettings::for_model("chatglm-6b"),
        DryRunBackend::new().with_accelerators(vec![AcceleratorInfo::mps()]),
    );
    let summary = service.reload().unwrap();
    assert_eq!(summary.dtype, DType::Float32);
    assert_eq!(summary.placement, Placement::Single(Device::Mps));
}

#[test]
fn test_cpu_fallback_reported_in_status() {
    let mut service = service_with(LoaderSettings::for_model("chatglm-6b"), DryRunBackend::new());
    service.reload().unwrap();

    let status = service.status();
    assert_eq!(status.state, LifecycleState::Ready);
    assert_eq!(status.warnings, vec![LoadWarning::CpuFallback]);
}

#[test]
fn test_prefix_tuning_failure_does_not_abort_load() {
    let ptuning = tempfile::tempdir().unwrap();
    fs::write(ptuning.path().join("config.json"), "not json").unwrap();

    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.use_ptuning_v2 = true;
    settings.ptuning_dir = ptuning.path().to_path_buf();
    let mut service = service_with(settings, backend(1));

    let summary = service.reload().unwrap();
    assert!(!summary.prefix_tuning);
    let status = service.status();
    assert_eq!(status.warnings.len(), 1);
    assert!(status.warnings[0].disabled(PREFIX_CONFIG_FEATURE));
}

#[test]
fn test_adapter_updates_persist_across_reload() {
    let lora = tempfile::tempdir().unwrap();
    for name in ["A", "B"] {
        fs::create_dir(lora.path().join(name)).unwrap();
    }

    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.lora_dir = lora.path().to_path_buf();
    let mut service = service_with(settings, backend(1));
    service.reload().unwrap();

    assert_eq!(service.apply_adapters(&names(&["A", "B"])).unwrap(), names(&["A", "B"]));
    assert_eq!(service.settings().lora, names(&["A", "B"]));

    let summary = service.reload().unwrap();
    assert_eq!(summary.adapters, names(&["A", "B"]));
}

#[test]
fn test_adapter_failure_unloads() {
    let lora = tempfile::tempdir().unwrap();
    let mut settings = LoaderSettings::for_model("chatglm-6b");
    settings.lora_dir = lora.path().to_path_buf();
    let mut service = service_with(settings, backend(1));
    service.reload().unwrap();

    assert!(service.apply_adapters(&names(&["missing"])).unwrap_err().is_adapter());
    assert_eq!(service.state(), LifecycleState::Empty);
    assert!(service.settings().lora.is_empty());
}
