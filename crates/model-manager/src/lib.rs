//! Model lifecycle management for the LLM loader
//!
//! This crate decides how a model is loaded on the detected hardware and
//! drives the backend through it: precision selection, device placement,
//! adapter reconciliation, prefix-tuning injection and the
//! `EMPTY -> LOADING -> READY -> UNLOADING` lifecycle.

pub mod adapters;
pub mod backend;
pub mod dry_run;
pub mod format;
pub mod handle;
pub mod loader;
pub mod precision;
pub mod prefix;
pub mod recovery;

// Re-export commonly used types
pub use adapters::{reconcile, MergeContext, ReconcileStrategy, Reconciliation};
pub use backend::{ModelBackend, ModelConfig, SpecialTokenIds, StateDict, TokenizerKind};
pub use dry_run::{BackendCall, DryRunBackend};
pub use format::detect_format;
pub use handle::{HandleSummary, ModelHandle, Placement};
pub use loader::ModelLoader;
pub use precision::{select, LoadFlags, ModelProfile, Selection};
pub use recovery::{recover_auxiliary, LoadWarning};
