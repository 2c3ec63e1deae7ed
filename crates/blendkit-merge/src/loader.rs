//! Checkpoint loading.
//!
//! Loading reads the whole file into memory and extracts the parameter
//! collection, unwrapping the `model` envelope entry when present. The
//! [`CheckpointLoader`] trait lets pipelines run against in-memory stores.

use std::path::Path;

use tracing::{debug, info};

use crate::envelope::decode_checkpoint;
use crate::{MergeError, ParameterCollection, Result};

/// Trait for reading a parameter collection from a checkpoint source.
pub trait CheckpointLoader {
    /// Load the parameter collection stored at `path`.
    ///
    /// Returns [`MergeError::NotFound`] if nothing exists at `path`.
    fn load(&self, path: &Path) -> Result<ParameterCollection>;
}

impl<T: CheckpointLoader + ?Sized> CheckpointLoader for &T {
    fn load(&self, path: &Path) -> Result<ParameterCollection> {
        (**self).load(path)
    }
}

/// Filesystem checkpoint store backed by safetensors files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsCheckpoints;

impl SafetensorsCheckpoints {
    /// Create a new filesystem store.
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointLoader for SafetensorsCheckpoints {
    fn load(&self, path: &Path) -> Result<ParameterCollection> {
        if !path.is_file() {
            return Err(MergeError::NotFound {
                path: path.to_path_buf(),
            });
        }

        info!("  - Loading: {}", path.display());
        let data = std::fs::read(path).map_err(|e| read_error(path, e))?;

        let params = decode_checkpoint(&data).map_err(|e| MergeError::ModelLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        debug!(
            "Loaded {} parameters ({} bytes) from {}",
            params.len(),
            params.byte_size(),
            path.display()
        );

        Ok(params)
    }
}

/// Attach the checkpoint path to a read failure.
fn read_error(path: &Path, err: std::io::Error) -> MergeError {
    match err.kind() {
        std::io::ErrorKind::NotFound => MergeError::NotFound {
            path: path.to_path_buf(),
        },
        _ => MergeError::ModelLoad {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
    }
}
