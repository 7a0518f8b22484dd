//! LLM loader command-line interface
//!
//! Runs the loader against the dry-run backend: hardware is described on the
//! command line, weights are never touched, and every decision the loader
//! makes is printed as JSON.

use std::path::PathBuf;
use anyhow::{anyhow, Context, Result};
use bytesize::ByteSize;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use common::models::MemoryLimit;
use common::utils::MIB;
use hardware_profiler::AcceleratorInfo;
use llm_loader::LoaderService;
use loader_config::{ConfigManager, LoaderSettings};
use model_manager::{DryRunBackend, ModelConfig};
use resource_manager::MemoryBudgetEstimator;

#[derive(Parser)]
#[command(name = "llm-loader")]
#[command(about = "Plan and simulate model loads across accelerators")]
#[command(version)]
struct Cli {
    /// Settings file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the load plan without loading
    Plan {
        #[command(flatten)]
        hardware: HardwareArgs,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run a full load against the dry-run backend
    Load {
        #[command(flatten)]
        hardware: HardwareArgs,
        #[command(flatten)]
        overrides: Overrides,
        /// Adapter list to move to after loading, comma separated
        #[arg(long, value_delimiter = ',')]
        then_adapters: Option<Vec<String>>,
    },
    /// Suggest a memory cap for a device
    Estimate {
        /// Device total memory in MiB
        #[arg(long)]
        total_mib: u64,
    },
    /// Print the effective settings as TOML
    ShowConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Simulated accelerator inventory
#[derive(Args)]
struct HardwareArgs {
    /// Number of CUDA devices
    #[arg(long, default_value_t = 0)]
    cuda: usize,

    /// Memory of each CUDA device, e.g. "24GiB"
    #[arg(long, default_value = "24GiB")]
    device_memory: String,

    /// Expose an MPS device instead of CUDA devices
    #[arg(long)]
    mps: bool,

    /// Layer count of models without a local config.json
    #[arg(long)]
    layers: Option<usize>,
}

impl HardwareArgs {
    fn backend(&self) -> Result<DryRunBackend> {
        let accelerators = if self.mps {
            vec![AcceleratorInfo::mps()]
        } else {
            let bytes = MemoryLimit::parse(&self.device_memory)
                .with_context(|| format!("invalid --device-memory '{}'", self.device_memory))?
                .bytes();
            (0..self.cuda).map(|i| AcceleratorInfo::cuda(i, bytes)).collect()
        };
        let backend = DryRunBackend::new().with_accelerators(accelerators);
        Ok(match self.layers {
            Some(layers) => backend.with_config(ModelConfig::with_layers(layers)),
            None => backend,
        })
    }
}

/// Settings overrides
#[derive(Args)]
struct Overrides {
    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// Resolve the model under this directory
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Adapters to attach at load time, comma separated
    #[arg(long, value_delimiter = ',')]
    lora: Option<Vec<String>>,

    /// Adapter root directory
    #[arg(long)]
    lora_dir: Option<PathBuf>,

    /// Prefix-tuning directory, enables prefix tuning
    #[arg(long)]
    ptuning_dir: Option<PathBuf>,

    /// Force CPU execution
    #[arg(long)]
    cpu: bool,

    /// Load weights as 8-bit integers
    #[arg(long)]
    load_in_8bit: bool,

    /// Use bfloat16
    #[arg(long)]
    bf16: bool,

    /// Infer placement under an estimated memory cap (on by default)
    #[arg(long, value_name = "BOOL")]
    auto_devices: Option<bool>,

    /// Per-device memory caps, comma separated
    #[arg(long, value_delimiter = ',')]
    gpu_memory: Option<Vec<String>>,

    /// Host memory cap
    #[arg(long)]
    cpu_memory: Option<String>,
}

impl Overrides {
    fn apply(self, settings: &mut LoaderSettings) {
        if let Some(model) = self.model {
            settings.model = model;
        }
        if let Some(dir) = self.model_dir {
            settings.no_remote_model = true;
            settings.model_dir = dir;
        }
        if let Some(lora) = self.lora {
            settings.lora = lora;
        }
        if let Some(dir) = self.lora_dir {
            settings.lora_dir = dir;
        }
        if let Some(dir) = self.ptuning_dir {
            settings.use_ptuning_v2 = true;
            settings.ptuning_dir = dir;
        }
        if let Some(gpu_memory) = self.gpu_memory {
            settings.gpu_memory = gpu_memory;
        }
        if self.cpu_memory.is_some() {
            settings.cpu_memory = self.cpu_memory;
        }
        settings.cpu |= self.cpu;
        settings.load_in_8bit |= self.load_in_8bit;
        settings.bf16 |= self.bf16;
        if let Some(auto_devices) = self.auto_devices {
            settings.auto_devices = auto_devices;
        }
    }
}

fn load_config(path: Option<&PathBuf>, overrides: Overrides) -> Result<ConfigManager> {
    let mut config = ConfigManager::new(path.map(PathBuf::as_path)).context("failed to load settings")?;
    overrides.apply(config.settings_mut());
    Ok(config)
}

fn mib_to_bytes(total_mib: u64) -> Result<u64> {
    total_mib
        .checked_mul(MIB)
        .ok_or_else(|| anyhow!("--total-mib {} overflows a byte count", total_mib))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { hardware, overrides } => {
            let config = load_config(cli.config.as_ref(), overrides)?;
            let _guard = logging::init_logging(&config.settings().logging)?;
            let service = LoaderService::new(config, hardware.backend()?);

            let selection = service.plan()?;
            info!(strategy = ?selection.plan.strategy, "Plan computed");
            print_json(&selection.plan)?;
            if !selection.warnings.is_empty() {
                print_json(&selection.warnings)?;
            }
        }
        Commands::Load {
            hardware,
            overrides,
            then_adapters,
        } => {
            let config = load_config(cli.config.as_ref(), overrides)?;
            let _guard = logging::init_logging(&config.settings().logging)?;
            let mut service = LoaderService::new(config, hardware.backend()?);

            let result = service.reload().and_then(|_| match &then_adapters {
                Some(desired) => service.apply_adapters(desired).map(|_| ()),
                None => Ok(()),
            });
            print_json(&service.status())?;
            result?;
        }
        Commands::Estimate { total_mib } => {
            let total = mib_to_bytes(total_mib)?;
            let cap = MemoryBudgetEstimator::default().estimate(total);
            println!(
                "device total {} -> suggested cap {} ({})",
                ByteSize::b(total),
                cap,
                ByteSize::b(cap.bytes())
            );
        }
        Commands::ShowConfig { overrides } => {
            let config = load_config(cli.config.as_ref(), overrides)?;
            if let Some(path) = config.source_path() {
                println!("# loaded from {}", path.display());
            }
            print!("{}", config.to_toml()?);
            if let Err(err) = config.validated() {
                eprintln!("warning: a reload with these settings would fail: {}", err);
            }
        }
    }

    Ok(())
}
