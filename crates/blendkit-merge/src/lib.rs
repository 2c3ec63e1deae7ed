//! Checkpoint blending for generator/discriminator model pairs.
//!
//! This crate averages the named parameters of several trained checkpoints
//! into one pretrained starting point, separately for the generator and the
//! discriminator of a two-network training setup.
//!
//! # Merge Topologies
//!
//! - **Flat**: equal-weight average of N peer checkpoints
//! - **Hierarchical**: peer average, then a weighted blend with a base model
//!   (`w * base + (1 - w) * mean(peers)`)
//!
//! # Merge Rules
//!
//! - Keys in every input with equal shapes are averaged
//! - Keys in every input with differing shapes keep the first input's tensor
//!   (or abort, see [`ShapeConflictPolicy`])
//! - Keys in only some inputs are copied from the first input holding them
//!
//! # Example
//!
//! ```ignore
//! use blendkit_merge::{MergePipeline, PipelineBuilder, SafetensorsCheckpoints};
//!
//! let config = PipelineBuilder::new()
//!     .add_peer("assets/model1", 35200)
//!     .add_peer("assets/model2", 74000)
//!     .base_folder("assets/model_base_0")
//!     .base_weight(0.5)
//!     .build()?;
//!
//! let report = MergePipeline::new(config, SafetensorsCheckpoints)?.run();
//! assert!(report.is_success());
//! ```

#![warn(missing_docs)]

mod component;
mod config;
pub mod envelope;
mod error;
mod loader;
mod merge;
mod pipeline;
mod tensor;
mod verify;
mod writer;

pub use component::*;
pub use config::*;
pub use error::*;
pub use loader::*;
pub use merge::*;
pub use pipeline::*;
pub use tensor::*;
pub use verify::*;
pub use writer::*;
