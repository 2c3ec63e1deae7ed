//! Checkpoint writing.

use std::path::Path;

use tracing::info;

use crate::envelope::encode_checkpoint;
use crate::{MergeError, ParameterCollection, Result, SafetensorsCheckpoints};

/// Trait for persisting a merged parameter collection.
pub trait CheckpointWriter {
    /// Write `params` to `path` wrapped as `{ "model": params }`.
    ///
    /// Any failure is reported as [`MergeError::Write`].
    fn write(&self, path: &Path, params: &ParameterCollection) -> Result<()>;
}

impl<T: CheckpointWriter + ?Sized> CheckpointWriter for &T {
    fn write(&self, path: &Path, params: &ParameterCollection) -> Result<()> {
        (**self).write(path, params)
    }
}

impl CheckpointWriter for SafetensorsCheckpoints {
    fn write(&self, path: &Path, params: &ParameterCollection) -> Result<()> {
        let write_error = |reason: String| MergeError::Write {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_error(e.to_string()))?;
        }

        let bytes = encode_checkpoint(params).map_err(|e| write_error(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|e| write_error(e.to_string()))?;

        info!(
            "Saved {} parameters to: {}",
            params.len(),
            path.display()
        );

        Ok(())
    }
}
