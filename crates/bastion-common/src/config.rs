//! ---
//! bastion_section: "01-core-functionality"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Shared primitives and utilities for the security runtime."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::time::LocalZone;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_max_requests() -> u32 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_trusted() -> Vec<String> {
    vec!["127.0.0.1".to_owned(), "::1".to_owned(), "localhost".to_owned()]
}

fn default_throttled_max_requests() -> u32 {
    10
}

fn default_sweep_every() -> u64 {
    1024
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_suspicious_agents() -> Vec<String> {
    [
        "sqlmap",
        "nikto",
        "nmap",
        "masscan",
        "zgrab",
        "python-requests",
        "curl",
        "wget",
        "nuclei",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_tolerance_steps() -> u32 {
    1
}

fn default_issuer() -> String {
    "Bastion".to_owned()
}

/// Primary configuration object for the security runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub totp: TotpConfig,
    #[serde(default)]
    pub policies: PolicyConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "BASTION_CONFIG";

    /// Load configuration from disk, respecting the `BASTION_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    ///
    /// Falls back to [`AppConfig::default`] when none of the candidates exist and no
    /// override is set; an override pointing at a missing file is an error.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: Self::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        self.detector.validate()?;
        self.totp.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Request ceiling, window, and identity lists for the admission gate.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub window: Duration,
    /// Identities that bypass limiting and are never reported as blocked.
    #[serde(default = "default_trusted")]
    pub trusted: Vec<String>,
    /// Identities blocked from startup; these cannot be unblocked at runtime.
    #[serde(default)]
    pub static_blocklist: Vec<String>,
    /// Ceiling installed for an identity by the `rate_limit` response action.
    #[serde(default = "default_throttled_max_requests")]
    pub throttled_max_requests: u32,
    /// Expired buckets are swept once every this many admissions.
    #[serde(default = "default_sweep_every")]
    pub sweep_every: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            trusted: default_trusted(),
            static_blocklist: Vec::new(),
            throttled_max_requests: default_throttled_max_requests(),
            sweep_every: default_sweep_every(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(anyhow!("rate_limit.max_requests must be greater than zero"));
        }
        if self.window.as_secs() == 0 {
            return Err(anyhow!("rate_limit.window must be at least one second"));
        }
        if self.throttled_max_requests == 0 || self.throttled_max_requests > self.max_requests {
            return Err(anyhow!(
                "rate_limit.throttled_max_requests must be between 1 and max_requests ({})",
                self.max_requests
            ));
        }
        if self.sweep_every == 0 {
            return Err(anyhow!("rate_limit.sweep_every must be greater than zero"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_query_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub query_timeout: Duration,
    /// Fixed offset used for business-hours and off-hours checks. Host local time when unset.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub disabled_patterns: Vec<String>,
    #[serde(default = "default_suspicious_agents")]
    pub suspicious_agents: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            query_timeout: default_query_timeout(),
            utc_offset_minutes: None,
            disabled_patterns: Vec::new(),
            suspicious_agents: default_suspicious_agents(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.query_timeout.is_zero() {
            return Err(anyhow!("detector.query_timeout must be greater than zero"));
        }
        self.local_zone()?;
        Ok(())
    }

    /// Resolve the configured offset into a [`LocalZone`].
    pub fn local_zone(&self) -> Result<LocalZone> {
        match self.utc_offset_minutes {
            None => Ok(LocalZone::Host),
            Some(minutes) => LocalZone::from_offset_minutes(minutes).ok_or_else(|| {
                anyhow!("detector.utc_offset_minutes {minutes} is out of range")
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpConfig {
    #[serde(default = "default_tolerance_steps")]
    pub tolerance_steps: u32,
    #[serde(default = "default_issuer")]
    pub issuer: String,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            tolerance_steps: default_tolerance_steps(),
            issuer: default_issuer(),
        }
    }
}

impl TotpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tolerance_steps > 10 {
            return Err(anyhow!(
                "totp.tolerance_steps {} exceeds the maximum of 10",
                self.tolerance_steps
            ));
        }
        if self.issuer.trim().is_empty() || self.issuer.contains(':') {
            return Err(anyhow!("totp.issuer must be non-empty and must not contain ':'"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// JSON document holding the initial policy set.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Newline-delimited JSON event log. Events are kept in memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(900));
        assert!(config.rate_limit.trusted.contains(&"127.0.0.1".to_string()));
        assert_eq!(config.totp.tolerance_steps, 1);
        assert_eq!(config.detector.query_timeout, Duration::from_secs(2));
        assert!(config.event_log.path.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = AppConfig::from_str(
            r#"
            [rate_limit]
            max_requests = 20
            window = 60
            throttled_max_requests = 5
            static_blocklist = ["203.0.113.9"]

            [detector]
            utc_offset_minutes = 60
            disabled_patterns = ["rapid_requests"]
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.static_blocklist, vec!["203.0.113.9"]);
        assert_eq!(config.detector.disabled_patterns, vec!["rapid_requests"]);
        assert!(matches!(
            config.detector.local_zone().unwrap(),
            LocalZone::Fixed(_)
        ));
    }

    #[test]
    fn invalid_ceiling_is_rejected() {
        let err = AppConfig::from_str("[rate_limit]\nmax_requests = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_requests"));
        assert!(AppConfig::from_str(
            "[rate_limit]\nmax_requests = 5\nthrottled_max_requests = 6\n"
        )
        .is_err());
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        assert!(AppConfig::from_str("[detector]\nutc_offset_minutes = 100000\n").is_err());
    }

    #[test]
    fn load_prefers_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion.toml");
        fs::write(&path, "[totp]\nissuer = \"Acme\"\n").unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, Some(path));
        assert_eq!(loaded.config.totp.issuer, "Acme");
    }
}
