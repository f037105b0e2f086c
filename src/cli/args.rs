//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Load a task plan (TOML or JSON) and run it to completion
//! - `show-config`: Show configuration discovery information

use super::plan::PlanFormat;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig { config_override: Option<PathBuf> },
}

#[derive(Debug)]
pub struct RunConfig {
    pub plan: PathBuf,
    pub format: PlanFormat,
    pub config_override: Option<PathBuf>,
    pub threads: Option<usize>,
    pub verbose: bool,
    pub dry_run: bool,
}

#[derive(Debug, Parser)]
#[command(name = "cotask")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cooperative coordinator for hierarchical tasks")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a task plan until every task has finished
    Run {
        /// Path to the plan (.toml or .json)
        plan: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Override the number of worker threads
        #[arg(short = 't', long = "threads")]
        threads: Option<usize>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
        /// Print the task tree without running it
        #[arg(short = 'n', long = "dry-run")]
        dry_run: bool,
    },
    /// Show configuration discovery information
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                plan,
                config,
                threads,
                verbose,
                dry_run,
            }) => {
                if *threads == Some(0) {
                    return Err("--threads must be at least 1".to_string());
                }
                Ok(ExecutionMode::Run(RunConfig {
                    format: Self::detect_plan_format(plan)?,
                    plan: plan.clone(),
                    config_override: config.clone(),
                    threads: *threads,
                    verbose: *verbose,
                    dry_run: *dry_run,
                }))
            }
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            None => Err(
                "No command specified. Use 'cotask --help' to see available commands.".to_string(),
            ),
        }
    }

    /// Plan format from the file extension, case-insensitive
    fn detect_plan_format(path: &Path) -> Result<PlanFormat, String> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "toml" => Ok(PlanFormat::Toml),
            "json" => Ok(PlanFormat::Json),
            other => Err(format!(
                "Unsupported plan file extension '{}': expected .toml or .json",
                other
            )),
        }
    }
}
