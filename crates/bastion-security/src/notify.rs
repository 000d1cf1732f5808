//! ---
//! bastion_section: "06-anomaly-detection"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Pattern detection, alerting, and automated response."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use async_trait::async_trait;
use tracing::warn;

use crate::alerts::SecurityAlert;

/// Best-effort delivery of alerts to administrators.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one alert.
    async fn notify(&self, alert: &SecurityAlert) -> anyhow::Result<()>;
}

/// Writes alerts to the tracing pipeline at `WARN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, alert: &SecurityAlert) -> anyhow::Result<()> {
        warn!(
            target: "bastion::notify",
            alert_id = %alert.id,
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            source_ip = alert.source_ip.as_deref().unwrap_or("-"),
            subject = alert.subject_id.as_deref().unwrap_or("-"),
            "{}",
            alert.title
        );
        Ok(())
    }
}
