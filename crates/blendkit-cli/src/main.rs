//! blendkit CLI - blend trained generator/discriminator checkpoints.

use std::path::{Path, PathBuf};

use anyhow::Context;
use blendkit_merge::{
    verify_checkpoint, BaseSource, CheckpointSource, Component, ComponentReport, MergePipeline,
    MergeTopology, OutputConfig, PipelineConfig, SafetensorsCheckpoints, ShapeConflictPolicy,
    VerificationReport,
};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Handling of parameters whose shapes differ between models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConflictMode {
    /// Keep the first model's tensor and report the conflict
    KeepFirst,
    /// Abort the component on the first conflict
    FailFast,
}

impl From<ConflictMode> for ShapeConflictPolicy {
    fn from(mode: ConflictMode) -> Self {
        match mode {
            ConflictMode::KeepFirst => ShapeConflictPolicy::KeepFirst,
            ConflictMode::FailFast => ShapeConflictPolicy::FailFast,
        }
    }
}

#[derive(Parser)]
#[command(name = "blendkit")]
#[command(author, version, about = "Blend trained G/D checkpoints into a pretrained pair", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Average peer checkpoints, optionally blended with a base model
    Merge(MergeArgs),

    /// Check merged checkpoints for every required sub-network
    Verify {
        /// Generator checkpoint to check
        #[arg(short, long)]
        generator: Option<PathBuf>,

        /// Discriminator checkpoint to check
        #[arg(short, long)]
        discriminator: Option<PathBuf>,
    },

    /// Write a sample merge configuration
    Init {
        /// Output file
        #[arg(short, long, default_value = "blendkit.yaml")]
        output: PathBuf,
    },
}

/// Arguments for the merge command. Every flag overrides only its own setting.
#[derive(Args, Debug, Clone, Default)]
struct MergeArgs {
    /// Path to merge configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer model as FOLDER:EPOCH (repeatable; order decides conflicts)
    #[arg(short, long = "peer", value_name = "FOLDER:EPOCH")]
    peers: Vec<String>,

    /// Base model folder holding f0G40k/f0D40k checkpoints
    #[arg(short, long)]
    base: Option<PathBuf>,

    /// Share of the base model in the final blend
    #[arg(long)]
    base_weight: Option<f64>,

    /// Checkpoint file extension
    #[arg(long)]
    ext: Option<String>,

    /// Merged generator output path
    #[arg(long)]
    output_generator: Option<PathBuf>,

    /// Merged discriminator output path
    #[arg(long)]
    output_discriminator: Option<PathBuf>,

    /// What to do when a parameter's shape differs between models
    #[arg(long, value_enum)]
    on_shape_conflict: Option<ConflictMode>,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Merge(args) => run_merge(resolve_config(&args)?),
        Commands::Verify {
            generator,
            discriminator,
        } => run_verify(&verify_targets(generator, discriminator)),
        Commands::Init { output } => generate_sample_config(&output),
    }
}

/// Load the YAML config (if any) and apply the command-line overrides.
fn resolve_config(args: &MergeArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => {
            if args.peers.is_empty() {
                anyhow::bail!("No peer models given. Use --peer FOLDER:EPOCH or --config FILE.");
            }
            PipelineConfig::new(Vec::new())
        }
    };
    apply_overrides(&mut config, args)?;
    Ok(config)
}

/// Apply command-line overrides to a pipeline configuration.
///
/// `--peer` replaces the configured peers. `--ext` moves the outputs to the new
/// extension only while they are still the default paths.
fn apply_overrides(config: &mut PipelineConfig, args: &MergeArgs) -> anyhow::Result<()> {
    if !args.peers.is_empty() {
        config.peers = args
            .peers
            .iter()
            .map(|p| CheckpointSource::parse(p))
            .collect::<Result<_, _>>()?;
    }
    if let Some(ext) = &args.ext {
        if config.output == OutputConfig::for_extension(&config.extension) {
            config.output = OutputConfig::for_extension(ext);
        }
        config.extension = ext.clone();
    }
    if let Some(folder) = &args.base {
        config.base = Some(BaseSource::folder(folder));
    }
    if let Some(weight) = args.base_weight {
        config.base_weight = weight;
    }
    if let Some(path) = &args.output_generator {
        config.output.generator = path.clone();
    }
    if let Some(path) = &args.output_discriminator {
        config.output.discriminator = path.clone();
    }
    if let Some(mode) = args.on_shape_conflict {
        config.on_shape_conflict = mode.into();
    }
    Ok(())
}

/// Files to verify; both default outputs when neither flag is given.
fn verify_targets(
    generator: Option<PathBuf>,
    discriminator: Option<PathBuf>,
) -> Vec<(Component, PathBuf)> {
    if generator.is_none() && discriminator.is_none() {
        let defaults = OutputConfig::default();
        return vec![
            (Component::Generator, defaults.generator),
            (Component::Discriminator, defaults.discriminator),
        ];
    }
    [
        (Component::Generator, generator),
        (Component::Discriminator, discriminator),
    ]
    .into_iter()
    .filter_map(|(component, path)| path.map(|p| (component, p)))
    .collect()
}

fn run_merge(config: PipelineConfig) -> anyhow::Result<()> {
    println!("========================================");
    println!("  blendkit Checkpoint Merge");
    println!("========================================");
    for (i, peer) in config.peers.iter().enumerate() {
        println!(
            "Peer {}:        {}",
            i + 1,
            peer.path_for(Component::Generator, &config.extension).display()
        );
    }
    if let Some(path) = config.base_path(Component::Generator) {
        println!("Base:          {}", path.display());
        println!("Base weight:   {:.2}", config.base_weight);
    }
    println!("Shape conflict: {:?}", config.on_shape_conflict);
    println!("========================================\n");

    let pipeline = MergePipeline::new(config, SafetensorsCheckpoints)?;
    let report = pipeline.run();

    println!("\n========================================");
    let mut failed = Vec::new();
    for component in Component::ALL {
        match report.get(component) {
            Ok(summary) => print_component_summary(summary),
            Err(e) => {
                println!("  {:<14} FAILED: {}", component.name(), e);
                failed.push(component.name());
            }
        }
    }
    println!("========================================");

    if !failed.is_empty() {
        anyhow::bail!("Merge failed for: {}", failed.join(", "));
    }

    println!("\nCheck the result with:");
    println!(
        "  blendkit verify --generator {} --discriminator {}",
        pipeline.config().output.generator.display(),
        pipeline.config().output.discriminator.display()
    );

    Ok(())
}

fn print_component_summary(summary: &ComponentReport) {
    let topology = match summary.topology {
        MergeTopology::Flat => "flat".to_string(),
        MergeTopology::Hierarchical { base_weight } => {
            format!("hierarchical, base {:.2}", base_weight)
        }
    };
    println!(
        "  {:<14} {} ({} parameters, {})",
        summary.component.name(),
        summary.output_path.display(),
        summary.parameters,
        topology
    );

    let conflicts = summary.shape_conflicts();
    if conflicts > 0 {
        println!("  {:<14} {} shape conflicts kept from the first model", "", conflicts);
        for stage in &summary.stages {
            for conflict in &stage.shape_conflicts {
                println!("  {:<14}   {}: {:?}", "", conflict.key, conflict.shapes);
            }
        }
    }
}

fn run_verify(targets: &[(Component, PathBuf)]) -> anyhow::Result<()> {
    let mut all_ok = true;

    for (component, path) in targets {
        let report = verify_checkpoint(&SafetensorsCheckpoints, path, *component)
            .with_context(|| format!("verifying {}", path.display()))?;
        print_verification(&report);
        all_ok &= report.passed();
    }

    println!("\n{}", "=".repeat(60));
    println!("FINAL VERDICT");
    println!("{}", "=".repeat(60));
    if !all_ok {
        anyhow::bail!("Checkpoints are missing required components (see above)");
    }
    println!("All checked files contain every required component.");
    Ok(())
}

fn print_verification(report: &VerificationReport) {
    println!("\n{}", "=".repeat(60));
    println!("Checking {}: {}", report.component, report.path.display());
    println!("{}", "=".repeat(60));

    let found: Vec<&str> = report.found_prefixes.iter().map(String::as_str).collect();
    println!("\nFound prefixes: {:?}", found);
    println!("\nRequired prefixes check:");
    for prefix in report.component.required_prefixes() {
        let status = if report.missing_prefixes.iter().any(|m| m == prefix) {
            "✗"
        } else {
            "✓"
        };
        println!("  {} {}", status, prefix);
    }

    if report.passed() {
        println!("\n{} is complete ({} parameters)", report.component, report.parameters);
    } else {
        println!(
            "\n{} is MISSING: {}",
            report.component,
            report.missing_prefixes.join(", ")
        );
    }
}

fn generate_sample_config(output: &Path) -> anyhow::Result<()> {
    let mut config = PipelineConfig::new(vec![
        CheckpointSource::epoch("assets/model1", 35200),
        CheckpointSource::epoch("assets/model2", 74000),
        CheckpointSource::epoch("assets/model3", 27200),
    ]);
    config.base = Some(BaseSource::folder("assets/model_base_0"));

    std::fs::write(output, config.to_yaml()?)?;

    println!("Sample configuration written to: {}", output.display());
    println!("\nYou can edit this file and run the merge with:");
    println!("  blendkit merge --config {}", output.display());

    Ok(())
}
