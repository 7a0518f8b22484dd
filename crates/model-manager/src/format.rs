//! Checkpoint format detection

use std::path::Path;
use tracing::info;
use walkdir::WalkDir;

use common::error::{Error, Result};
use common::types::CheckpointFormat;

/// Detects the on-disk format of a checkpoint directory.
///
/// The local checkpoint directory is scanned even when the model resolves
/// remotely. A directory holding `ggml*.bin` files is a legacy binary
/// checkpoint; the first file by name is the one handed to the legacy
/// loader. A missing directory is standard.
pub fn detect_format(dir: &Path) -> Result<CheckpointFormat> {
    if !dir.is_dir() {
        return Ok(CheckpointFormat::Standard);
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            Error::Model(format!("Failed to scan checkpoint directory {}: {}", dir.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if name.starts_with("ggml") && name.ends_with(".bin") {
            info!("Legacy binary weights found: {}", entry.path().display());
            return Ok(CheckpointFormat::LegacyBinary {
                weights: entry.path().to_path_buf(),
            });
        }
    }

    Ok(CheckpointFormat::Standard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_legacy_weights_detected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        fs::write(dir.path().join("ggml-model-q4_1.bin"), b"").unwrap();
        fs::write(dir.path().join("ggml-model-q4_0.bin"), b"").unwrap();

        let format = detect_format(dir.path()).unwrap();
        assert_eq!(
            format,
            CheckpointFormat::LegacyBinary {
                weights: dir.path().join("ggml-model-q4_0.bin")
            }
        );
    }

    #[test]
    fn test_standard_local_and_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();
        fs::create_dir(dir.path().join("ggml-subdir.bin")).unwrap();

        let format = detect_format(dir.path()).unwrap();
        assert!(!format.is_legacy());

        let missing = detect_format(&dir.path().join("absent")).unwrap();
        assert!(!missing.is_legacy());
    }
}
