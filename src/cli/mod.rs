// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
//   qe-trainer train    --config experiments/predictor.yaml
//   qe-trainer evaluate --config experiments/evaluate.yaml
//   qe-trainer search   --config experiments/search.yaml
//   qe-trainer resolve  --config experiments/bert.yaml
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{Commands, ConfigArgs};

use crate::infra::config_resolver::{to_yaml, ConfigResolver};

#[derive(Parser, Debug)]
#[command(
    name = "qe-trainer",
    version,
    about = "Train multi-task translation quality estimation models from YAML configurations."
)]
pub struct Cli {
    /// Log at debug level
    #[arg(long, short, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Log warnings and errors only
    #[arg(long, short, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default `tracing` directive for the chosen verbosity.
    pub fn log_directive(&self) -> &'static str {
        match (self.verbose, self.quiet) {
            (true, _) => "qe_trainer=debug",
            (_, true) => "qe_trainer=warn",
            _ => "qe_trainer=info",
        }
    }

    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)    => run_train(args),
            Commands::Evaluate(args) => run_evaluate(args),
            Commands::Search(args)   => run_search(args),
            Commands::Resolve(args)  => run_resolve(args),
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<crate::domain::config::ExperimentConfig> {
    ConfigResolver::resolve_file(&args.config)
        .with_context(|| format!("resolving configuration '{}'", args.config.display()))
}

fn run_train(args: ConfigArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    let config = load_config(&args)?;
    tracing::info!("Training '{}' from '{}'", config.run.experiment_name, args.config.display());
    let outcome = TrainUseCase::new(config).execute()?;

    let report = &outcome.report;
    println!("Run {} finished: {:?} after {} steps", outcome.run_id, report.status, report.global_step);
    match (&report.best, &report.best_path) {
        (Some(best), Some(path)) => {
            println!("Best {}={:.4} at step {} → {}", best.metric, best.value, best.step, path.display());
        }
        _ => println!("No checkpoint was saved"),
    }
    println!("Output directory: {}", outcome.output_dir.display());
    Ok(())
}

fn run_evaluate(args: ConfigArgs) -> Result<()> {
    use crate::application::evaluate_use_case::EvaluateUseCase;

    let config = load_config(&args)?;
    let outcome = EvaluateUseCase::new(config).execute()?;

    println!("Checkpoint {} on {}:", outcome.checkpoint.display(), outcome.split);
    for (name, value) in &outcome.metrics {
        println!("  {name:<24} {value:.4}");
    }
    Ok(())
}

fn run_search(args: ConfigArgs) -> Result<()> {
    use crate::application::search_use_case::SearchUseCase;

    let outcome = SearchUseCase::from_file(&args.config)?.execute()?;
    println!("{} trials written to {}", outcome.trials.len(), outcome.directory.display());
    match outcome.best() {
        Some(best) => println!(
            "Best trial {}: {}={:.4} ({})",
            best.number,
            best.metric,
            best.score,
            best.output_dir.display()
        ),
        None => println!("No trial produced a checkpoint"),
    }
    Ok(())
}

fn run_resolve(args: ConfigArgs) -> Result<()> {
    let config = load_config(&args)?;
    print!("{}", to_yaml(&config)?);
    Ok(())
}
