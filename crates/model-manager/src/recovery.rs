//! Recoverable load failures
//!
//! Optional features fail soft: the error is logged, recorded as a
//! [`LoadWarning`] and the feature is disabled while the base load continues.

use serde::{Deserialize, Serialize};
use tracing::warn;

use common::error::{Error, Result};

/// Non-fatal event observed during a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadWarning {
    /// No accelerator was found and the load fell back to the CPU
    CpuFallback,
    /// Memory caps were requested but none could be resolved
    MemoryCapsUnavailable,
    /// An optional feature was disabled
    FeatureDisabled {
        /// Feature name
        feature: String,
        /// Why it was disabled
        reason: String,
    },
}

impl LoadWarning {
    /// Returns true if `feature` was disabled
    pub fn disabled(&self, feature: &str) -> bool {
        matches!(self, LoadWarning::FeatureDisabled { feature: f, .. } if f == feature)
    }
}

/// Maps a failure of `feature` to "disabled, continue".
///
/// Returns the value on success. On failure logs a warning, pushes a
/// [`LoadWarning::FeatureDisabled`] onto `warnings` and returns `None`.
pub fn recover_auxiliary<T>(
    feature: &str,
    result: Result<T>,
    warnings: &mut Vec<LoadWarning>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            let reason = match err {
                Error::AuxiliaryFeature { reason, .. } => reason,
                other => other.to_string(),
            };
            warn!("Disabling {}: {}", feature, reason);
            warnings.push(LoadWarning::FeatureDisabled {
                feature: feature.to_string(),
                reason,
            });
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_passes_through() {
        let mut warnings = Vec::new();
        assert_eq!(recover_auxiliary("prefix", Ok(7), &mut warnings), Some(7));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_failure_disables_feature() {
        let mut warnings = Vec::new();
        let result: Result<()> = Err(Error::auxiliary("prefix", "config.json missing"));

        assert_eq!(recover_auxiliary("prefix", result, &mut warnings), None);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].disabled("prefix"));
        assert_eq!(
            warnings[0],
            LoadWarning::FeatureDisabled {
                feature: "prefix".to_string(),
                reason: "config.json missing".to_string(),
            }
        );
    }

    #[test]
    fn test_any_error_is_recovered() {
        let mut warnings = Vec::new();
        let result: Result<u8> = Err(Error::Backend("shape mismatch".to_string()));
        assert!(recover_auxiliary("prefix", result, &mut warnings).is_none());
        assert!(!warnings[0].disabled("other"));
    }
}
