//! Generator / discriminator component kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two independently merged sub-networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Generator (`G_<epoch>` checkpoints).
    Generator,
    /// Discriminator (`D_<epoch>` checkpoints).
    Discriminator,
}

impl Component {
    /// Both components, in processing order.
    pub const ALL: [Component; 2] = [Component::Generator, Component::Discriminator];

    /// Lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Discriminator => "discriminator",
        }
    }

    /// Prefix of per-epoch checkpoint file names (`G` in `G_35200`).
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Generator => "G",
            Self::Discriminator => "D",
        }
    }

    /// File stem of the base pretrained checkpoint.
    pub fn default_base_stem(self) -> &'static str {
        match self {
            Self::Generator => "f0G40k",
            Self::Discriminator => "f0D40k",
        }
    }

    /// Epoch checkpoint file name, e.g. `G_35200.safetensors`.
    pub fn epoch_file_name(self, epoch: u64, extension: &str) -> String {
        format!("{}_{}.{}", self.file_prefix(), epoch, extension)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
