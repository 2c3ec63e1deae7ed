//! Configuration types for checkpoint blending.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Component, MergeError, ShapeConflictPolicy};

/// Default checkpoint file extension.
pub const DEFAULT_EXTENSION: &str = "safetensors";

/// Default share of the base model in the hierarchical stage.
pub const DEFAULT_BASE_WEIGHT: f64 = 0.5;

/// Complete pipeline configuration, typically loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Peer models, averaged with equal weight. Order decides conflict resolution.
    pub peers: Vec<CheckpointSource>,

    /// Base model combined with the peer average. Enables the hierarchical merge.
    #[serde(default)]
    pub base: Option<BaseSource>,

    /// Share of the base model in the second stage (peers get `1 - base_weight`).
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,

    /// Checkpoint file extension used to build epoch/base file names.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Output locations.
    #[serde(default)]
    pub output: OutputConfig,

    /// Handling of keys whose shapes disagree across inputs.
    #[serde(default)]
    pub on_shape_conflict: ShapeConflictPolicy,
}

fn default_base_weight() -> f64 {
    DEFAULT_BASE_WEIGHT
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

/// Where a peer model's checkpoints live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointSource {
    /// Training-run folder holding `G_<epoch>.<ext>` and `D_<epoch>.<ext>`.
    Epoch {
        /// Model folder.
        folder: PathBuf,
        /// Saved epoch/step number.
        epoch: u64,
    },
    /// Explicit per-component paths.
    Paths {
        /// Generator checkpoint.
        generator: PathBuf,
        /// Discriminator checkpoint.
        discriminator: PathBuf,
    },
}

impl CheckpointSource {
    /// Source from a training folder and epoch.
    pub fn epoch(folder: impl Into<PathBuf>, epoch: u64) -> Self {
        Self::Epoch {
            folder: folder.into(),
            epoch,
        }
    }

    /// Source from explicit generator/discriminator paths.
    pub fn paths(generator: impl Into<PathBuf>, discriminator: impl Into<PathBuf>) -> Self {
        Self::Paths {
            generator: generator.into(),
            discriminator: discriminator.into(),
        }
    }

    /// Parse `FOLDER:EPOCH`.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (folder, epoch) = s.rsplit_once(':').ok_or_else(|| {
            MergeError::InvalidConfig(format!("expected FOLDER:EPOCH, got '{s}'"))
        })?;
        if folder.is_empty() {
            return Err(MergeError::InvalidConfig(format!(
                "missing folder in '{s}'"
            )));
        }
        let epoch = epoch.parse::<u64>().map_err(|e| {
            MergeError::InvalidConfig(format!("invalid epoch in '{s}': {e}"))
        })?;
        Ok(Self::epoch(folder, epoch))
    }

    /// Checkpoint path for `component`.
    pub fn path_for(&self, component: Component, extension: &str) -> PathBuf {
        match self {
            Self::Epoch { folder, epoch } => {
                folder.join(component.epoch_file_name(*epoch, extension))
            }
            Self::Paths {
                generator,
                discriminator,
            } => match component {
                Component::Generator => generator.clone(),
                Component::Discriminator => discriminator.clone(),
            },
        }
    }
}

/// Where the base model's checkpoints live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseSource {
    /// Explicit per-component paths.
    Paths {
        /// Generator checkpoint.
        generator: PathBuf,
        /// Discriminator checkpoint.
        discriminator: PathBuf,
    },
    /// Folder holding `<generator_stem>.<ext>` and `<discriminator_stem>.<ext>`.
    Folder {
        /// Base model folder.
        folder: PathBuf,
        /// Generator file stem (default `f0G40k`).
        #[serde(default = "default_generator_stem")]
        generator_stem: String,
        /// Discriminator file stem (default `f0D40k`).
        #[serde(default = "default_discriminator_stem")]
        discriminator_stem: String,
    },
}

fn default_generator_stem() -> String {
    Component::Generator.default_base_stem().to_string()
}

fn default_discriminator_stem() -> String {
    Component::Discriminator.default_base_stem().to_string()
}

impl BaseSource {
    /// Base folder using the default `f0G40k`/`f0D40k` stems.
    pub fn folder(folder: impl Into<PathBuf>) -> Self {
        Self::Folder {
            folder: folder.into(),
            generator_stem: default_generator_stem(),
            discriminator_stem: default_discriminator_stem(),
        }
    }

    /// Checkpoint path for `component`.
    pub fn path_for(&self, component: Component, extension: &str) -> PathBuf {
        match self {
            Self::Paths {
                generator,
                discriminator,
            } => match component {
                Component::Generator => generator.clone(),
                Component::Discriminator => discriminator.clone(),
            },
            Self::Folder {
                folder,
                generator_stem,
                discriminator_stem,
            } => {
                let stem = match component {
                    Component::Generator => generator_stem,
                    Component::Discriminator => discriminator_stem,
                };
                folder.join(format!("{stem}.{extension}"))
            }
        }
    }
}

/// Output checkpoint locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Merged generator checkpoint.
    pub generator: PathBuf,
    /// Merged discriminator checkpoint.
    pub discriminator: PathBuf,
}

impl OutputConfig {
    /// `merge_G/f0G40k.<ext>` and `merge_D/f0D40k.<ext>`.
    pub fn for_extension(extension: &str) -> Self {
        let path = |component: Component| {
            PathBuf::from(format!("merge_{}", component.file_prefix()))
                .join(format!("{}.{}", component.default_base_stem(), extension))
        };
        Self {
            generator: path(Component::Generator),
            discriminator: path(Component::Discriminator),
        }
    }

    /// Output path for `component`.
    pub fn path_for(&self, component: Component) -> &Path {
        match component {
            Component::Generator => &self.generator,
            Component::Discriminator => &self.discriminator,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self::for_extension(DEFAULT_EXTENSION)
    }
}

impl PipelineConfig {
    /// Flat merge over `peers` with default settings.
    pub fn new(peers: Vec<CheckpointSource>) -> Self {
        Self {
            peers,
            base: None,
            base_weight: DEFAULT_BASE_WEIGHT,
            extension: default_extension(),
            output: OutputConfig::default(),
            on_shape_conflict: ShapeConflictPolicy::default(),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.peers.is_empty() {
            return Err(MergeError::EmptyInput);
        }

        if !(0.0..=1.0).contains(&self.base_weight) {
            return Err(MergeError::InvalidConfig(format!(
                "base_weight must be within [0, 1], got {}",
                self.base_weight
            )));
        }

        if self.extension.is_empty() || self.extension.starts_with('.') {
            return Err(MergeError::InvalidConfig(format!(
                "extension must be non-empty and without a leading dot, got '{}'",
                self.extension
            )));
        }

        if self.output.generator == self.output.discriminator {
            return Err(MergeError::InvalidConfig(
                "generator and discriminator outputs must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Peer checkpoint paths for `component`, in configured order.
    pub fn peer_paths(&self, component: Component) -> Vec<PathBuf> {
        self.peers
            .iter()
            .map(|peer| peer.path_for(component, &self.extension))
            .collect()
    }

    /// Base checkpoint path for `component`, if a base model is configured.
    pub fn base_path(&self, component: Component) -> Option<PathBuf> {
        self.base
            .as_ref()
            .map(|base| base.path_for(component, &self.extension))
    }

    /// Output path for `component`.
    pub fn output_path(&self, component: Component) -> &Path {
        self.output.path_for(component)
    }
}
