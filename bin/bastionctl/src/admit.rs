//! ---
//! bastion_section: "08-operator-tooling"
//! bastion_subsection: "binary"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Offline admission-gate simulation."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use bastion_common::logging::init_tracing;
use bastion_common::time::ManualClock;
use bastion_security::service::SecurityCore;
use chrono::Utc;
use clap::Args;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::ConfigArgs;

/// Options for `simulate-admit`.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Identity (usually a source address) sending the requests.
    #[arg(long)]
    pub identity: String,
    /// Number of requests, all sent within the same instant.
    #[arg(long, default_value_t = 10)]
    pub requests: u32,
}

/// Send `requests` requests through a fresh core on a frozen clock and tally the outcomes.
///
/// Log records go to stdout and to the rolling file under `[logging].directory`.
pub fn run(args: SimulateArgs, config: &ConfigArgs) -> Result<()> {
    let mut config = config.load()?;
    init_tracing("bastionctl", &config.logging)?;
    config.event_log.path = None;
    let runtime = Runtime::new()?;
    let tally = runtime.block_on(async {
        let core = SecurityCore::builder(config)
            .clock(Arc::new(ManualClock::new(Utc::now())))
            .build()?;
        let mut tally: BTreeMap<String, u32> = BTreeMap::new();
        for request in 1..=args.requests {
            let outcome = core.admit_request(&args.identity).await;
            debug!(request, outcome = outcome.reason(), "simulated request");
            *tally.entry(outcome.reason().to_owned()).or_default() += 1;
        }
        core.shutdown().await;
        anyhow::Ok(tally)
    })?;
    for (reason, count) in tally {
        println!("{reason:<24} {count}");
    }
    Ok(())
}
