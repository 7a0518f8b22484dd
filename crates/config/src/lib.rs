//! Configuration management for the LLM loader
//!
//! This crate provides the single configuration record consumed by the
//! lifecycle controller, layered from defaults, an optional file and the
//! environment.

pub mod manager;
pub mod settings;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use settings::{LoaderSettings, LoggingSettings};
