//! ---
//! bastion_section: "01-core-functionality"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Shared primitives and utilities for the security runtime."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! Core shared primitives for the Bastion workspace.
//! This crate exposes configuration loading, tracing setup, and the clock
//! abstraction consumed by every time-dependent security component.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, DetectorConfig, EventLogConfig, LoggingConfig, PolicyConfig, RateLimitConfig,
    TotpConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{Clock, LocalZone, ManualClock, SystemClock};
