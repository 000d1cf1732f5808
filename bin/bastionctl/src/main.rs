//! ---
//! bastion_section: "08-operator-tooling"
//! bastion_subsection: "binary"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Operator CLI for the Bastion security core."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use bastion_common::config::AppConfig;
use bastion_common::logging::init_cli_tracing;
use clap::{Args, Parser, Subcommand};

mod admit;
mod policy;
mod totp;

#[derive(Debug, Parser)]
#[command(author, version, about = "Bastion security operator utility", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Where to find the configuration file.
#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Path to the configuration file; `BASTION_CONFIG` takes precedence.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    /// Load the first configuration found, falling back to defaults.
    pub fn load(&self) -> Result<AppConfig> {
        let mut candidates = Vec::new();
        if let Some(path) = &self.config {
            candidates.push(path.clone());
        }
        candidates.push(PathBuf::from("configs/bastion.toml"));
        AppConfig::load(&candidates)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "TOTP secret and code utilities")]
    Totp(totp::TotpCommand),
    #[command(subcommand, about = "Policy document checks")]
    Policy(policy::PolicyCommand),
    #[command(about = "Print the active detection patterns as JSON")]
    Patterns,
    #[command(about = "Replay requests from one identity through the admission gate")]
    SimulateAdmit(admit::SimulateArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // simulate-admit runs the whole core and installs the file-backed subscriber itself
    if !matches!(cli.command, Commands::SimulateAdmit(_)) {
        init_cli_tracing();
    }
    match cli.command {
        Commands::Totp(cmd) => totp::run(cmd, &cli.config)?,
        Commands::Policy(cmd) => policy::run(cmd, &cli.config)?,
        Commands::Patterns => policy::print_patterns(&cli.config)?,
        Commands::SimulateAdmit(args) => admit::run(args, &cli.config)?,
    }
    Ok(())
}
