//! Adapter set reconciliation
//!
//! Computes how to move from the adapters currently merged into a model to a
//! desired list, then drives the backend through that transition. Merged
//! adapters cannot be unmerged one at a time, so any removal rebuilds the
//! whole set: the first adapter becomes the base merge and the rest are
//! loaded on top of it in order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use common::error::Result;
use common::models::{AdapterDiff, AdapterSet, Device, DeviceSlot};

use crate::backend::{AdapterMergeParams, ModelBackend};

/// Key prefix of modules inside a merged adapter model
pub const MERGED_MODEL_PREFIX: &str = "base_model.model.";

/// How a reconciliation is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStrategy {
    /// Nothing changes
    NoOp,
    /// New adapters are loaded onto the existing base merge
    IncrementalAttach,
    /// Every adapter is detached and the desired list merged from scratch
    FullRebuild,
}

impl fmt::Display for ReconcileStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileStrategy::NoOp => write!(f, "no-op"),
            ReconcileStrategy::IncrementalAttach => write!(f, "incremental-attach"),
            ReconcileStrategy::FullRebuild => write!(f, "full-rebuild"),
        }
    }
}

/// Outcome of [`reconcile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Adapters to attach
    pub to_add: BTreeSet<String>,
    /// Adapters to drop
    pub to_remove: BTreeSet<String>,
    /// Strategy
    pub strategy: ReconcileStrategy,
    /// Snapshot the model holds once the strategy has been applied
    pub next: AdapterSet,
}

/// Diffs `current` against `desired`
pub fn reconcile(current: &AdapterSet, desired: &[String]) -> Reconciliation {
    let mut seen = BTreeSet::new();
    let desired: Vec<String> = desired
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect();

    let current_set = current.as_set();
    let desired_set: BTreeSet<String> = desired.iter().cloned().collect();
    let to_add: BTreeSet<String> = desired_set.difference(&current_set).cloned().collect();
    let to_remove: BTreeSet<String> = current_set.difference(&desired_set).cloned().collect();

    let (strategy, names) = if to_add.is_empty() && to_remove.is_empty() {
        (ReconcileStrategy::NoOp, current.names().to_vec())
    } else if to_remove.is_empty() && !current.is_empty() {
        let mut names = current.names().to_vec();
        names.extend(desired.iter().filter(|n| to_add.contains(*n)).cloned());
        (ReconcileStrategy::IncrementalAttach, names)
    } else {
        (ReconcileStrategy::FullRebuild, desired)
    };

    let diff = AdapterDiff {
        to_add: to_add.clone(),
        to_remove: to_remove.clone(),
    };

    Reconciliation {
        to_add,
        to_remove,
        strategy,
        next: AdapterSet::new(names, diff),
    }
}

/// Model facts an adapter merge depends on
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    /// Root directory of adapters
    pub lora_dir: &'a Path,
    /// Model runs on the CPU
    pub cpu: bool,
    /// Model is 8-bit quantized
    pub quantized: bool,
    /// Device a rebuilt merge is moved back to
    pub rehome_to: Device,
}

/// Applies a reconciliation to a loaded model
pub fn apply<B: ModelBackend>(
    backend: &B,
    model: &mut B::Model,
    tokenizer: &B::Tokenizer,
    reconciliation: &Reconciliation,
    context: &MergeContext<'_>,
) -> Result<()> {
    match reconciliation.strategy {
        ReconcileStrategy::NoOp => {
            debug!("Adapter set unchanged");
            Ok(())
        }
        ReconcileStrategy::IncrementalAttach => {
            let names = reconciliation
                .next
                .names()
                .iter()
                .filter(|name| reconciliation.to_add.contains(*name));
            for name in names {
                info!("Adding adapter {}", name);
                backend.load_adapter(model, &context.lora_dir.join(name), name)?;
            }
            Ok(())
        }
        ReconcileStrategy::FullRebuild => rebuild(backend, model, tokenizer, reconciliation, context),
    }
}

fn rebuild<B: ModelBackend>(
    backend: &B,
    model: &mut B::Model,
    tokenizer: &B::Tokenizer,
    reconciliation: &Reconciliation,
    context: &MergeContext<'_>,
) -> Result<()> {
    if !reconciliation.to_remove.is_empty() {
        info!("Removing adapters {:?}", reconciliation.to_remove);
        backend.disable_adapters(model)?;
    }

    let Some((base, rest)) = reconciliation.next.names().split_first() else {
        return Ok(());
    };

    let params = merge_params(backend, model, context);
    backend.resize_token_embeddings(model, backend.tokenizer_len(tokenizer))?;

    info!("Applying adapters {:?}", reconciliation.next.names());
    backend.merge_base_adapter(model, &context.lora_dir.join(base), base, &params)?;
    for name in rest {
        backend.load_adapter(model, &context.lora_dir.join(name), name)?;
    }

    if !context.cpu && !context.quantized && backend.model_device_map(model).is_none() {
        debug!("Moving merged model to {}", context.rehome_to);
        backend.to_device(model, context.rehome_to)?;
    }

    Ok(())
}

/// Merge arguments for a base adapter
pub fn merge_params<B: ModelBackend>(
    backend: &B,
    model: &B::Model,
    context: &MergeContext<'_>,
) -> AdapterMergeParams {
    if context.cpu {
        return AdapterMergeParams::default();
    }

    let device_map = match backend.model_device_map(model) {
        Some(map) => Some(map.prefixed(MERGED_MODEL_PREFIX)),
        None if context.quantized => Some(BTreeMap::from([(String::new(), DeviceSlot::Accelerator(0))])),
        None => None,
    };

    AdapterMergeParams {
        dtype: Some(backend.model_dtype(model)),
        device_map,
    }
}
