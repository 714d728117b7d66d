//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::commands::controller::ControllerArgs;
use super::commands::lint::LintArgs;

#[derive(Parser)]
#[command(name = "kubext")]
#[command(about = "Kubext - workflow controller for multi-step and DAG jobs", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Process settings file (defaults to .kubext/config.yaml)
    #[arg(short, long, global = true, env = "KUBEXT_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the workflow controller against the in-memory cluster
    Controller(ControllerArgs),

    /// Validate workflow files without submitting them
    Lint(LintArgs),
}
