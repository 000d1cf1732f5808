//! ---
//! bastion_section: "08-operator-tooling"
//! bastion_subsection: "binary"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "TOTP secret generation and code checks."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use anyhow::{bail, Result};
use bastion_security::totp;
use chrono::{DateTime, Utc};
use clap::Subcommand;

use crate::ConfigArgs;

/// TOTP utilities.
#[derive(Debug, Subcommand)]
pub enum TotpCommand {
    /// Generate a secret and its provisioning URI.
    Secret {
        /// Account label shown in authenticator apps.
        #[arg(long, default_value = "user")]
        account: String,
        /// Issuer; defaults to `[totp] issuer`.
        #[arg(long)]
        issuer: Option<String>,
    },
    /// Print the code for a secret.
    Code {
        /// Base32 secret.
        #[arg(long)]
        secret: String,
        /// RFC 3339 instant; defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Check a code against a secret using the configured tolerance.
    Verify {
        /// Base32 secret.
        #[arg(long)]
        secret: String,
        /// Six-digit code.
        #[arg(long)]
        code: String,
    },
}

/// Execute a TOTP command.
pub fn run(command: TotpCommand, config: &ConfigArgs) -> Result<()> {
    match command {
        TotpCommand::Secret { account, issuer } => {
            let issuer = match issuer {
                Some(issuer) => issuer,
                None => config.load()?.totp.issuer,
            };
            let secret = totp::generate_secret();
            println!("secret: {secret}");
            println!("uri:    {}", totp::provisioning_uri(&secret, &account, &issuer));
        }
        TotpCommand::Code { secret, at } => {
            println!("{}", totp::generate_code(&secret, at.unwrap_or_else(Utc::now)));
        }
        TotpCommand::Verify { secret, code } => {
            let tolerance = config.load()?.totp.tolerance_steps;
            if !totp::verify_code(&secret, &code, Utc::now(), tolerance) {
                bail!("code rejected");
            }
            println!("code accepted");
        }
    }
    Ok(())
}
