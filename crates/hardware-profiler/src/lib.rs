//! Hardware detection for the LLM loader
//!
//! This crate takes a snapshot of the host: CPU cores, system memory and the
//! accelerators the serving backend can see.

pub mod capabilities;
pub mod probe;

// Re-export commonly used types
pub use capabilities::HardwareCapabilities;
pub use probe::{AcceleratorBackend, AcceleratorInfo, AcceleratorProbe, NoAccelerators, StaticProbe};
