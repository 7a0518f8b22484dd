//! Common utilities and types for the LLM loader
//!
//! This crate provides shared functionality used across the loader workspace,
//! including the error type, the placement and precision data model, and
//! utility functions.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
pub use types::*;
