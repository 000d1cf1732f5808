//! ---
//! bastion_section: "01-core-functionality"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Shared primitives and utilities for the security runtime."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "BASTION_LOG";

static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Available log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    StructuredJson,
    /// Human-readable multi-field lines.
    Pretty,
}

/// `BASTION_LOG`, then `RUST_LOG`, then `fallback`.
fn env_filter(fallback: &str) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid {LOG_ENV} directive {directive:?}: {err}"),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let timer = fmt::time::UtcTime::rfc_3339();
    match format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .flatten_event(true)
            .with_timer(timer)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer().with_timer(timer).with_writer(writer).boxed(),
    }
}

/// The decision trail: always JSON, always with targets, so `bastion::notify` and
/// response records can be filtered after the fact.
fn audit_file_layer<S>(writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(writer)
        .boxed()
}

/// Install the process-wide subscriber: console output in the configured format plus
/// a daily-rolling JSON file `<prefix>.log` under `config.directory`.
///
/// Only the first call installs anything; later calls still create the directory and
/// report success.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    if GUARDS.get().is_some() {
        return Ok(());
    }
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    let (file_writer, file_guard) =
        tracing_appender::non_blocking(rolling::daily(&config.directory, format!("{prefix}.log")));
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stdout());

    let installed = tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(console_layer(config.format, console_writer))
        .with(audit_file_layer(file_writer))
        .try_init()
        .is_ok();
    let _ = GUARDS.set((file_guard, console_guard));
    if installed {
        info!(
            service = service_name,
            log_dir = %config.directory.display(),
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(())
}

/// Install a plain stderr subscriber for command-line tools. Repeated calls are no-ops.
pub fn init_cli_tracing() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
