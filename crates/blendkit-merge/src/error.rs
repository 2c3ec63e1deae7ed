//! Error types for checkpoint merging operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading, merging or writing checkpoints.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A required input checkpoint does not exist.
    #[error("Checkpoint not found: {}", path.display())]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// A merge stage was invoked with no input collections.
    #[error("Merge stage requires at least one parameter collection, got none")]
    EmptyInput,

    /// A key is present in every input but the shapes disagree.
    ///
    /// Only raised under [`ShapeConflictPolicy::FailFast`](crate::ShapeConflictPolicy);
    /// the default policy records a diagnostic instead.
    #[error("Shape conflict for parameter '{key}': {shapes:?}")]
    ShapeConflict {
        /// Parameter key.
        key: String,
        /// Shape observed in each input, in input order.
        shapes: Vec<Vec<usize>>,
    },

    /// Persisting a merged checkpoint failed.
    #[error("Failed to write checkpoint {}: {reason}", path.display())]
    Write {
        /// Destination path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Checkpoint exists but could not be decoded.
    #[error("Failed to load checkpoint {}: {reason}", path.display())]
    ModelLoad {
        /// Source path.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Tensor buffer does not agree with its dtype and shape.
    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    /// Tensor dtype cannot take part in arithmetic.
    #[error("Unsupported dtype {dtype:?} for parameter '{key}'")]
    UnsupportedDtype {
        /// Parameter key.
        key: String,
        /// Offending dtype.
        dtype: safetensors::Dtype,
    },

    /// Weighting does not have one entry per input.
    #[error("Expected {expected} merge weights, got {actual}")]
    WeightCountMismatch {
        /// Number of input collections.
        expected: usize,
        /// Number of weights supplied.
        actual: usize,
    },

    /// Weighting contains negative, non-finite or all-zero entries.
    #[error("Invalid merge weights: {0}")]
    InvalidWeights(String),

    /// Invalid pipeline configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
