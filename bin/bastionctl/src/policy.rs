//! ---
//! bastion_section: "08-operator-tooling"
//! bastion_subsection: "binary"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Policy linting, offline evaluation, and pattern listing."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bastion_security::attributes::DecisionContext;
use bastion_security::evaluator::PolicyEvaluator;
use bastion_security::patterns::canonical;
use bastion_security::policy::parse_policies;
use clap::Subcommand;

use crate::ConfigArgs;

/// Policy document commands.
#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Evaluate a request context against a policy file.
    Check {
        /// JSON policy document (array or single policy).
        #[arg(long, value_name = "FILE")]
        policies: PathBuf,
        /// JSON decision context.
        #[arg(long, value_name = "FILE")]
        context: PathBuf,
    },
    /// Validate a policy file without evaluating anything.
    Lint {
        /// JSON policy document.
        #[arg(long, value_name = "FILE")]
        policies: PathBuf,
    },
}

/// Execute a policy command.
pub fn run(command: PolicyCommand, config: &ConfigArgs) -> Result<()> {
    match command {
        PolicyCommand::Check { policies, context } => {
            let zone = config.load()?.detector.local_zone()?;
            let evaluator = PolicyEvaluator::new(zone);
            evaluator
                .load_json(&read(&policies)?)
                .with_context(|| format!("invalid policy file {}", policies.display()))?;
            let context: DecisionContext = serde_json::from_str(&read(&context)?)
                .with_context(|| format!("invalid context file {}", context.display()))?;
            let result = evaluator.evaluate(&context);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        PolicyCommand::Lint { policies } => {
            let parsed = parse_policies(&read(&policies)?)
                .with_context(|| format!("invalid policy file {}", policies.display()))?;
            for policy in &parsed {
                println!(
                    "{:<24} {:<5} priority {:>4}  {}",
                    policy.id, policy.effect, policy.priority, policy.name
                );
            }
            println!("{} policies ok", parsed.len());
        }
    }
    Ok(())
}

/// Print the detection patterns the configuration would activate.
pub fn print_patterns(config: &ConfigArgs) -> Result<()> {
    let config = config.load()?;
    let patterns: Vec<_> = canonical(&config.detector.suspicious_agents)
        .into_iter()
        .filter(|pattern| !config.detector.disabled_patterns.contains(&pattern.id))
        .collect();
    println!("{}", serde_json::to_string_pretty(&patterns)?);
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))
}
