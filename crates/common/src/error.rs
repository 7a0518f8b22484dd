//! Error types for the common crate
//!
//! This module defines the error type shared by every crate of the loader.

use thiserror::Error;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for loader operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error. Fatal for the reload in progress.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource error
    #[error("Resource error: {0}")]
    Resource(String),

    /// Model error
    #[error("Model error: {0}")]
    Model(String),

    /// Adapter merge error
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Optional feature failed to load; callers are expected to disable it
    #[error("Auxiliary feature '{feature}' failed: {reason}")]
    AuxiliaryFeature {
        /// Feature name
        feature: String,
        /// Failure description
        reason: String,
    },

    /// Error reported by the model-serving backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates an auxiliary feature error
    pub fn auxiliary(feature: impl Into<String>, reason: impl ToString) -> Self {
        Error::AuxiliaryFeature {
            feature: feature.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the error is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Returns true if the error is an adapter error
    pub fn is_adapter(&self) -> bool {
        matches!(self, Error::Adapter(_))
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if the error comes from an optional feature
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, Error::AuxiliaryFeature { .. })
    }

    /// Returns true if the error is an invalid state error
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("8-bit placement needs a device map".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: 8-bit placement needs a device map"
        );

        let err = Error::auxiliary("prefix-config", "missing pre_seq_len");
        assert_eq!(
            err.to_string(),
            "Auxiliary feature 'prefix-config' failed: missing pre_seq_len"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Config(String::new()).is_config());
        assert!(Error::Adapter(String::new()).is_adapter());
        assert!(Error::NotFound(String::new()).is_not_found());
        assert!(Error::auxiliary("x", "y").is_auxiliary());
        assert!(!Error::Model(String::new()).is_config());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config.json");
        let err: Error = io_err.into();
        assert!(err.to_string().starts_with("IO error"));
    }
}
