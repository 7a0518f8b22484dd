//! Common types for the LLM loader
//!
//! Small enumerations shared between the planner, the selector and the
//! lifecycle controller.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Lifecycle state of the model handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LifecycleState {
    /// Nothing is loaded
    #[default]
    Empty,
    /// A reload is materializing a model
    Loading,
    /// A model and tokenizer are loaded and in evaluation mode
    Ready,
    /// Resources of the previous model are being released
    Unloading,
}

impl LifecycleState {
    /// Returns true if a model is loaded and usable
    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    /// Returns true if nothing is loaded
    pub fn is_empty(&self) -> bool {
        matches!(self, LifecycleState::Empty)
    }

    /// Returns true if `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Empty, Loading)
                | (Loading, Ready)
                | (Loading, Empty)
                | (Ready, Unloading)
                | (Empty, Unloading)
                | (Unloading, Empty)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Empty => write!(f, "EMPTY"),
            LifecycleState::Loading => write!(f, "LOADING"),
            LifecycleState::Ready => write!(f, "READY"),
            LifecycleState::Unloading => write!(f, "UNLOADING"),
        }
    }
}

/// Numeric type the weights are materialized in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit float
    Float32,
    /// 16-bit float
    Float16,
    /// bfloat16
    BFloat16,
    /// 8-bit quantized integers
    Int8,
}

impl DType {
    /// Bytes used per parameter
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            DType::Float32 => 4,
            DType::Float16 | DType::BFloat16 => 2,
            DType::Int8 => 1,
        }
    }

    /// Half precision type for accelerator loads
    pub fn half(bf16: bool) -> Self {
        if bf16 {
            DType::BFloat16
        } else {
            DType::Float16
        }
    }

    /// Returns true for quantized types
    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::Int8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Float32 => write!(f, "float32"),
            DType::Float16 => write!(f, "float16"),
            DType::BFloat16 => write!(f, "bfloat16"),
            DType::Int8 => write!(f, "int8"),
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(DType::Float32),
            "float16" | "fp16" | "f16" | "half" => Ok(DType::Float16),
            "bfloat16" | "bf16" => Ok(DType::BFloat16),
            "int8" | "8bit" => Ok(DType::Int8),
            _ => Err(format!("Unknown dtype: {}", s)),
        }
    }
}

/// Model family, selected once from the model configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Tokenizer loaded through the generic path
    #[default]
    Standard,
    /// Llama tokenizer with forced special token ids
    Llama,
}

/// Head the checkpoint is instantiated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    /// Causal language model head
    #[default]
    CausalLm,
    /// Bare model class (chatglm checkpoints ship their own head)
    Base,
}

impl ModelClass {
    /// Picks the class from the model name
    pub fn for_model_name(name: &str) -> Self {
        if name.to_lowercase().contains("chatglm") {
            ModelClass::Base
        } else {
            ModelClass::CausalLm
        }
    }
}

/// On-disk weight format of the checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    /// Standard pretrained checkpoint
    #[default]
    Standard,
    /// Legacy single-file binary weights, handled by the legacy loader
    LegacyBinary {
        /// First weight file found in the checkpoint directory
        weights: std::path::PathBuf,
    },
}

impl CheckpointFormat {
    /// Returns true for the legacy binary format
    pub fn is_legacy(&self) -> bool {
        matches!(self, CheckpointFormat::LegacyBinary { .. })
    }
}
