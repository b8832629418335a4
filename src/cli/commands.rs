// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the four subcommands. Every command is driven by a
// YAML file; nothing about the experiment is set by flags.
//
//   train     — resolve a config and train it
//   evaluate  — score the checkpoint named by `system.load`
//   search    — random search over a base training config
//   resolve   — print the fully resolved config and exit
//
// Reference: Rust Book §12 (Building a CLI Program)

use std::path::PathBuf;

use clap::{Args, Subcommand};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a QE system from a YAML configuration
    Train(ConfigArgs),

    /// Report validation metrics of a trained checkpoint
    Evaluate(ConfigArgs),

    /// Run a hyperparameter search from a search configuration
    Search(ConfigArgs),

    /// Print the configuration with every `defaults` fragment merged in
    Resolve(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Root YAML file; `defaults` fragments resolve relative to it
    #[arg(long, short)]
    pub config: PathBuf,
}
