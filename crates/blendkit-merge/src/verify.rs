//! Structural completeness checks for merged checkpoints.
//!
//! A merged checkpoint is only usable as a pretrained starting point if every
//! sub-network the training code expects has parameters in it. The check is
//! purely name based: each required top-level prefix must own at least one key.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{CheckpointLoader, Component, ParameterCollection, Result};

/// Generator sub-networks: text encoder, decoder, posterior encoder,
/// normalizing flow and speaker embedding.
pub const GENERATOR_PREFIXES: &[&str] = &["enc_p.", "dec.", "enc_q.", "flow.", "emb_g."];

/// Discriminator ensemble namespace.
pub const DISCRIMINATOR_PREFIXES: &[&str] = &["discriminators."];

impl Component {
    /// Key prefixes that must be present in a complete checkpoint.
    pub fn required_prefixes(self) -> &'static [&'static str] {
        match self {
            Self::Generator => GENERATOR_PREFIXES,
            Self::Discriminator => DISCRIMINATOR_PREFIXES,
        }
    }
}

/// Outcome of checking one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Checked file.
    pub path: PathBuf,
    /// Component the file was checked as.
    pub component: Component,
    /// Number of parameters in the file.
    pub parameters: usize,
    /// Top-level prefixes present (`enc_p.`, `dec.`, ...), sorted.
    pub found_prefixes: BTreeSet<String>,
    /// Required prefixes with no parameters, in requirement order.
    pub missing_prefixes: Vec<String>,
}

impl VerificationReport {
    /// Whether every required prefix was found.
    pub fn passed(&self) -> bool {
        self.missing_prefixes.is_empty()
    }
}

/// Check an in-memory collection against `component`'s required prefixes.
pub fn verify_parameters(
    path: &Path,
    params: &ParameterCollection,
    component: Component,
) -> VerificationReport {
    let found_prefixes: BTreeSet<String> = params
        .keys()
        .map(|key| {
            let head = key.split('.').next().unwrap_or(key);
            format!("{head}.")
        })
        .collect();

    let missing_prefixes = component
        .required_prefixes()
        .iter()
        .filter(|prefix| !params.keys().any(|key| key.starts_with(*prefix)))
        .map(|prefix| prefix.to_string())
        .collect();

    VerificationReport {
        path: path.to_path_buf(),
        component,
        parameters: params.len(),
        found_prefixes,
        missing_prefixes,
    }
}

/// Load the checkpoint at `path` and check it as `component`.
///
/// Read-only; the file is never modified.
pub fn verify_checkpoint<L: CheckpointLoader>(
    loader: &L,
    path: &Path,
    component: Component,
) -> Result<VerificationReport> {
    let params = loader.load(path)?;
    let report = verify_parameters(path, &params, component);
    debug!(
        "Verified {} as {}: {} prefixes found, {} missing",
        path.display(),
        component,
        report.found_prefixes.len(),
        report.missing_prefixes.len()
    );
    Ok(report)
}
