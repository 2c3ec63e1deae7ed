//! Merge orchestration.
//!
//! This module sequences loading, the merge stages and writing for both
//! components. Two topologies are supported:
//!
//! - **Flat**: one stage averaging all peers at `1/N`.
//! - **Hierarchical**: the flat stage, then a second stage over
//!   `[base, peer_average]` weighted `[w, 1 - w]`.
//!
//! Generator and discriminator runs are independent: a failure in one never
//! prevents the other from being written.

use std::path::PathBuf;

use tracing::{error, info};

use crate::{
    BaseSource, CheckpointLoader, CheckpointSource, CheckpointWriter, Component, MergeError,
    MergeReport, MergeWeighting, OutputConfig, ParameterCollection, ParameterMerger,
    PipelineConfig, Result, SafetensorsCheckpoints, ShapeConflictPolicy,
};

/// Shape of the merge for one component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeTopology {
    /// Single equal-weight stage over the peers.
    Flat,
    /// Equal-weight peer stage followed by a base/peer-average stage.
    Hierarchical {
        /// Share of the base model in the second stage.
        base_weight: f64,
    },
}

/// Summary of one component's merge.
#[derive(Debug, Clone)]
pub struct ComponentReport {
    /// Merged component.
    pub component: Component,
    /// Topology that was applied.
    pub topology: MergeTopology,
    /// Written checkpoint.
    pub output_path: PathBuf,
    /// Diagnostics for each stage, in execution order.
    pub stages: Vec<MergeReport>,
    /// Number of parameters written.
    pub parameters: usize,
}

impl ComponentReport {
    /// Total shape conflicts across all stages.
    pub fn shape_conflicts(&self) -> usize {
        self.stages.iter().map(|s| s.shape_conflicts.len()).sum()
    }
}

/// Per-component outcomes of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Generator outcome.
    pub generator: Result<ComponentReport>,
    /// Discriminator outcome.
    pub discriminator: Result<ComponentReport>,
}

impl PipelineReport {
    /// Whether both components were merged and written.
    pub fn is_success(&self) -> bool {
        self.generator.is_ok() && self.discriminator.is_ok()
    }

    /// Outcome for `component`.
    pub fn get(&self, component: Component) -> &Result<ComponentReport> {
        match component {
            Component::Generator => &self.generator,
            Component::Discriminator => &self.discriminator,
        }
    }
}

/// Runs the configured topology over a checkpoint store.
pub struct MergePipeline<S> {
    config: PipelineConfig,
    store: S,
    merger: ParameterMerger,
}

impl<S: CheckpointLoader + CheckpointWriter> MergePipeline<S> {
    /// Create a pipeline; fails if `config` does not validate.
    pub fn new(config: PipelineConfig, store: S) -> Result<Self> {
        config.validate()?;
        let merger = ParameterMerger::with_policy(config.on_shape_conflict);
        Ok(Self {
            config,
            store,
            merger,
        })
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Topology implied by the configuration.
    pub fn topology(&self) -> MergeTopology {
        match self.config.base {
            Some(_) => MergeTopology::Hierarchical {
                base_weight: self.config.base_weight,
            },
            None => MergeTopology::Flat,
        }
    }

    /// Load and merge `component` without writing it.
    ///
    /// Every input is loaded before the first stage runs; any missing file
    /// aborts the component.
    pub fn merge_component(
        &self,
        component: Component,
    ) -> Result<(ParameterCollection, Vec<MergeReport>)> {
        let base = match self.config.base_path(component) {
            Some(path) => {
                info!("Loading base {}...", component);
                Some(self.store.load(&path)?)
            }
            None => None,
        };

        let peer_paths = self.config.peer_paths(component);
        info!("Loading {} peer {}s...", peer_paths.len(), component);
        let peers = peer_paths
            .iter()
            .map(|path| self.store.load(path))
            .collect::<Result<Vec<_>>>()?;

        match base {
            None => {
                info!("Merging {} peer {}s...", peers.len(), component);
                let outcome = self.merger.merge(peers, None)?;
                Ok((outcome.parameters, vec![outcome.report]))
            }
            Some(base) => {
                let w = self.config.base_weight;

                info!("Step 1: Merging peer models together...");
                let peer_average = self.merger.merge(peers, None)?;

                info!(
                    "Step 2: Merging result with base model ({:.2}/{:.2})...",
                    w,
                    1.0 - w
                );
                let weighting = MergeWeighting::split(w)?;
                let combined = self
                    .merger
                    .merge(vec![base, peer_average.parameters], Some(&weighting))?;

                Ok((combined.parameters, vec![peer_average.report, combined.report]))
            }
        }
    }

    /// Load, merge and write `component`.
    pub fn run_component(&self, component: Component) -> Result<ComponentReport> {
        info!(
            "{} PROCESSING {}S {}",
            "=".repeat(30),
            component.name().to_uppercase(),
            "=".repeat(30)
        );

        let (parameters, stages) = self.merge_component(component)?;
        let output_path = self.config.output_path(component).to_path_buf();
        self.store.write(&output_path, &parameters)?;

        info!("Saved final {} to: {}", component, output_path.display());

        Ok(ComponentReport {
            component,
            topology: self.topology(),
            output_path,
            stages,
            parameters: parameters.len(),
        })
    }

    /// Run both components. Each outcome is reported independently.
    pub fn run(&self) -> PipelineReport {
        info!("{}", "=".repeat(60));
        match self.topology() {
            MergeTopology::Flat => {
                info!("MODE: {} models, equal weights", self.config.peers.len())
            }
            MergeTopology::Hierarchical { base_weight } => info!(
                "MODE: Base model ({:.0}%) + {} new models",
                base_weight * 100.0,
                self.config.peers.len()
            ),
        }
        info!("Shape conflicts: {:?}", self.merger.policy());
        info!("{}", "=".repeat(60));

        let run = |component: Component| {
            let outcome = self.run_component(component);
            if let Err(e) = &outcome {
                error!("{} merge failed: {}", component, e);
            }
            outcome
        };

        let report = PipelineReport {
            generator: run(Component::Generator),
            discriminator: run(Component::Discriminator),
        };

        if report.is_success() {
            info!("{}", "=".repeat(60));
            info!("MERGE COMPLETED SUCCESSFULLY!");
            info!("{}", "=".repeat(60));
        }

        report
    }
}

/// Builder for creating pipeline configurations programmatically.
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    peers: Vec<CheckpointSource>,
    base: Option<BaseSource>,
    base_weight: Option<f64>,
    extension: Option<String>,
    output_generator: Option<PathBuf>,
    output_discriminator: Option<PathBuf>,
    on_shape_conflict: ShapeConflictPolicy,
}

impl PipelineBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer from a training folder and epoch.
    pub fn add_peer(self, folder: impl Into<PathBuf>, epoch: u64) -> Self {
        self.add_source(CheckpointSource::epoch(folder, epoch))
    }

    /// Add a peer source.
    pub fn add_source(mut self, source: CheckpointSource) -> Self {
        self.peers.push(source);
        self
    }

    /// Use a base folder with the default `f0G40k`/`f0D40k` stems.
    pub fn base_folder(self, folder: impl Into<PathBuf>) -> Self {
        self.base(BaseSource::folder(folder))
    }

    /// Set the base model source.
    pub fn base(mut self, base: BaseSource) -> Self {
        self.base = Some(base);
        self
    }

    /// Set the base share of the hierarchical stage.
    pub fn base_weight(mut self, weight: f64) -> Self {
        self.base_weight = Some(weight);
        self
    }

    /// Set the checkpoint extension.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Set the merged generator path.
    pub fn output_generator(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_generator = Some(path.into());
        self
    }

    /// Set the merged discriminator path.
    pub fn output_discriminator(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_discriminator = Some(path.into());
        self
    }

    /// Set the shape-conflict policy.
    pub fn on_shape_conflict(mut self, policy: ShapeConflictPolicy) -> Self {
        self.on_shape_conflict = policy;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<PipelineConfig> {
        if self.peers.is_empty() {
            return Err(MergeError::EmptyInput);
        }

        let mut config = PipelineConfig::new(self.peers);
        if let Some(extension) = self.extension {
            config.output = OutputConfig::for_extension(&extension);
            config.extension = extension;
        }
        if let Some(path) = self.output_generator {
            config.output.generator = path;
        }
        if let Some(path) = self.output_discriminator {
            config.output.discriminator = path;
        }
        if let Some(weight) = self.base_weight {
            config.base_weight = weight;
        }
        config.base = self.base;
        config.on_shape_conflict = self.on_shape_conflict;

        config.validate()?;
        Ok(config)
    }

    /// Build and run against the filesystem.
    pub fn run(self) -> Result<PipelineReport> {
        let config = self.build()?;
        Ok(MergePipeline::new(config, SafetensorsCheckpoints)?.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ShapeConflict, Tensor};
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;

    /// In-memory checkpoint store.
    #[derive(Default)]
    struct MemoryStore {
        files: RefCell<HashMap<PathBuf, ParameterCollection>>,
        read_only: HashSet<PathBuf>,
    }

    impl MemoryStore {
        fn put(&self, path: impl Into<PathBuf>, params: ParameterCollection) {
            self.files.borrow_mut().insert(path.into(), params);
        }

        fn get(&self, path: impl AsRef<Path>) -> Option<ParameterCollection> {
            self.files.borrow().get(path.as_ref()).cloned()
        }
    }

    impl CheckpointLoader for MemoryStore {
        fn load(&self, path: &Path) -> Result<ParameterCollection> {
            self.get(path).ok_or_else(|| MergeError::NotFound {
                path: path.to_path_buf(),
            })
        }
    }

    impl CheckpointWriter for MemoryStore {
        fn write(&self, path: &Path, params: &ParameterCollection) -> Result<()> {
            if self.read_only.contains(path) {
                return Err(MergeError::Write {
                    path: path.to_path_buf(),
                    reason: "read-only".to_string(),
                });
            }
            self.put(path, params.clone());
            Ok(())
        }
    }

    fn params(entries: &[(&str, &[f32])]) -> ParameterCollection {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Tensor::from_f32(&[v.len()], v).unwrap()))
            .collect()
    }

    fn values(params: &ParameterCollection, key: &str) -> Vec<f32> {
        params.get(key).unwrap().to_f32_vec().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() <= 1e-6 * e.abs().max(1.0), "{actual:?} != {expected:?}");
        }
    }

    /// Three peers under `runs/m{i}` with generator and discriminator files.
    fn store_with_peers(peer_values: &[f32]) -> MemoryStore {
        let store = MemoryStore::default();
        for (i, v) in peer_values.iter().enumerate() {
            let folder = format!("runs/m{i}");
            store.put(
                format!("{folder}/G_{i}.safetensors"),
                params(&[("enc_p.weight", &[*v, *v]), ("dec.bias", &[*v])]),
            );
            store.put(
                format!("{folder}/D_{i}.safetensors"),
                params(&[("discriminators.0.weight", &[*v * 10.0])]),
            );
        }
        store
    }

    fn peers_builder(n: usize) -> PipelineBuilder {
        (0..n).fold(PipelineBuilder::new(), |b, i| {
            b.add_peer(format!("runs/m{i}"), i as u64)
        })
    }

    #[test]
    fn test_flat_merge_both_components() {
        let store = store_with_peers(&[1.0, 2.0, 3.0]);
        let config = peers_builder(3).build().unwrap();
        let pipeline = MergePipeline::new(config, &store).unwrap();
        assert_eq!(pipeline.topology(), MergeTopology::Flat);

        let report = pipeline.run();
        assert!(report.is_success());

        let g = store.get("merge_G/f0G40k.safetensors").unwrap();
        assert_close(&values(&g, "enc_p.weight"), &[2.0, 2.0]);
        assert_close(&values(&g, "dec.bias"), &[2.0]);
        assert!(!g.contains_key("discriminators.0.weight"));

        let d = store.get("merge_D/f0D40k.safetensors").unwrap();
        assert_close(&values(&d, "discriminators.0.weight"), &[20.0]);
        assert_eq!(d.len(), 1);

        let g_report = report.generator.as_ref().unwrap();
        assert_eq!(g_report.stages.len(), 1);
        assert_eq!(g_report.parameters, 2);
    }

    #[test]
    fn test_hierarchical_merge_weights_base() {
        let store = store_with_peers(&[1.0, 2.0, 6.0]);
        store.put(
            "base/f0G40k.safetensors",
            params(&[("enc_p.weight", &[10.0, 20.0]), ("dec.bias", &[0.0])]),
        );
        store.put(
            "base/f0D40k.safetensors",
            params(&[("discriminators.0.weight", &[1.0])]),
        );

        let w = 0.25;
        let config = peers_builder(3)
            .base_folder("base")
            .base_weight(w)
            .build()
            .unwrap();
        let pipeline = MergePipeline::new(config, &store).unwrap();
        assert_eq!(pipeline.topology(), MergeTopology::Hierarchical { base_weight: w });

        let report = pipeline.run();
        assert!(report.is_success());

        // w * B + (1 - w) * mean(P)
        let g = store.get("merge_G/f0G40k.safetensors").unwrap();
        let mean = (1.0 + 2.0 + 6.0) / 3.0;
        assert_close(
            &values(&g, "enc_p.weight"),
            &[0.25 * 10.0 + 0.75 * mean, 0.25 * 20.0 + 0.75 * mean],
        );
        assert_close(&values(&g, "dec.bias"), &[0.75 * mean]);

        let d = store.get("merge_D/f0D40k.safetensors").unwrap();
        assert_close(&values(&d, "discriminators.0.weight"), &[0.25 * 1.0 + 0.75 * 30.0]);

        assert_eq!(report.generator.as_ref().unwrap().stages.len(), 2);
    }

    #[test]
    fn test_base_wins_second_stage_conflicts() {
        let store = store_with_peers(&[1.0, 3.0]);
        store.put(
            "base/f0G40k.safetensors",
            params(&[
                ("enc_p.weight", &[9.0, 9.0, 9.0]),
                ("dec.bias", &[0.0]),
                ("emb_g.weight", &[5.0]),
            ]),
        );
        store.put("base/f0D40k.safetensors", params(&[("discriminators.0.weight", &[0.0])]));

        let config = peers_builder(2).base_folder("base").build().unwrap();
        let pipeline = MergePipeline::new(config, &store).unwrap();
        let (merged, stages) = pipeline.merge_component(Component::Generator).unwrap();

        assert_eq!(values(&merged, "enc_p.weight"), vec![9.0, 9.0, 9.0]);
        assert_eq!(values(&merged, "emb_g.weight"), vec![5.0]);
        assert_close(&values(&merged, "dec.bias"), &[1.0]);
        assert_eq!(
            stages[1].shape_conflicts,
            vec![ShapeConflict {
                key: "enc_p.weight".to_string(),
                shapes: vec![vec![3], vec![2]],
            }]
        );
        assert_eq!(stages[1].partial_keys, 1);
    }

    #[test]
    fn test_missing_peer_aborts_only_that_component() {
        let store = store_with_peers(&[1.0, 2.0]);
        store.files.borrow_mut().remove(Path::new("runs/m1/D_1.safetensors"));

        let config = peers_builder(2).build().unwrap();
        let report = MergePipeline::new(config, &store).unwrap().run();

        assert!(report.generator.is_ok());
        assert!(store.get("merge_G/f0G40k.safetensors").is_some());

        match &report.discriminator {
            Err(MergeError::NotFound { path }) => {
                assert_eq!(path, Path::new("runs/m1/D_1.safetensors"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(store.get("merge_D/f0D40k.safetensors").is_none());
        assert!(!report.is_success());
    }

    #[test]
    fn test_missing_base_aborts_component() {
        let store = store_with_peers(&[1.0]);
        let config = peers_builder(1).base_folder("nowhere").build().unwrap();
        let report = MergePipeline::new(config, &store).unwrap().run();

        for component in Component::ALL {
            assert!(matches!(report.get(component), Err(MergeError::NotFound { .. })));
        }
        assert!(store.get("merge_G/f0G40k.safetensors").is_none());
        assert!(store.get("merge_D/f0D40k.safetensors").is_none());
    }

    #[test]
    fn test_write_failure_is_independent() {
        let mut store = store_with_peers(&[1.0, 2.0]);
        store.read_only.insert(PathBuf::from("merge_G/f0G40k.safetensors"));

        let config = peers_builder(2).build().unwrap();
        let report = MergePipeline::new(config, &store).unwrap().run();

        assert!(matches!(report.generator, Err(MergeError::Write { .. })));
        assert!(report.discriminator.is_ok());
        assert!(store.get("merge_D/f0D40k.safetensors").is_some());
    }

    #[test]
    fn test_fail_fast_propagates() {
        let store = store_with_peers(&[1.0]);
        store.put("runs/m1/G_1.safetensors", params(&[("enc_p.weight", &[1.0, 2.0, 3.0])]));
        store.put("runs/m1/D_1.safetensors", params(&[("discriminators.0.weight", &[1.0])]));

        let config = peers_builder(2)
            .on_shape_conflict(ShapeConflictPolicy::FailFast)
            .build()
            .unwrap();
        let report = MergePipeline::new(config, &store).unwrap().run();

        assert!(matches!(
            &report.generator,
            Err(MergeError::ShapeConflict { key, .. }) if key == "enc_p.weight"
        ));
        assert!(report.discriminator.is_ok());
    }

    #[test]
    fn test_builder_requires_peers() {
        assert!(matches!(PipelineBuilder::new().build(), Err(MergeError::EmptyInput)));
    }

    #[test]
    fn test_builder_extension_sets_outputs() {
        let config = PipelineBuilder::new()
            .add_peer("a", 1)
            .extension("pth")
            .output_discriminator("custom/D.pth")
            .build()
            .unwrap();

        assert_eq!(config.output.generator, PathBuf::from("merge_G/f0G40k.pth"));
        assert_eq!(config.output.discriminator, PathBuf::from("custom/D.pth"));
        assert_eq!(config.peer_paths(Component::Generator), vec![PathBuf::from("a/G_1.pth")]);
    }
}
