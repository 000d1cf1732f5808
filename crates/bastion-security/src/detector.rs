//! ---
//! bastion_section: "06-anomaly-detection"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Pattern detection, alerting, and automated response."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! Pattern detection over the recorded event stream.
//!
//! Analysis is anchored on the triggering event: the window is
//! `[event.timestamp - window, event.timestamp]` and only events ordered at or
//! before the trigger are counted, so the outcome for a given event does not
//! depend on how far the worker lags behind the producers.

use std::sync::Arc;
use std::time::Duration;

use bastion_common::time::{Clock, LocalZone};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::alerts::{AlertBook, CallbackRegistry, SecurityAlert};
use crate::events::{EventFilter, EventLog, EventLogError, SecurityEvent};
use crate::metrics::SecurityMetrics;
use crate::patterns::{Correlation, SecurityPattern};
use crate::response::ResponseExecutor;

/// Upper bound on events fetched per history query.
pub const HISTORY_LIMIT: usize = 5_000;

/// Why a pattern could not be evaluated for an event.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// The history query did not finish in time.
    #[error("history query timed out after {0:?}")]
    Timeout(Duration),
    /// The event log failed.
    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

/// Evaluates patterns against events and raises alerts.
pub struct PatternDetector {
    patterns: RwLock<Arc<Vec<SecurityPattern>>>,
    event_log: Arc<dyn EventLog>,
    responder: Arc<ResponseExecutor>,
    callbacks: Arc<CallbackRegistry>,
    alerts: Arc<AlertBook>,
    metrics: Option<SecurityMetrics>,
    clock: Arc<dyn Clock>,
    zone: LocalZone,
    query_timeout: Duration,
}

impl PatternDetector {
    /// Assemble a detector.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        patterns: Vec<SecurityPattern>,
        event_log: Arc<dyn EventLog>,
        responder: Arc<ResponseExecutor>,
        callbacks: Arc<CallbackRegistry>,
        alerts: Arc<AlertBook>,
        metrics: Option<SecurityMetrics>,
        clock: Arc<dyn Clock>,
        zone: LocalZone,
        query_timeout: Duration,
    ) -> Self {
        Self {
            patterns: RwLock::new(Arc::new(patterns)),
            event_log,
            responder,
            callbacks,
            alerts,
            metrics,
            clock,
            zone,
            query_timeout,
        }
    }

    /// Patterns currently evaluated.
    pub fn patterns(&self) -> Arc<Vec<SecurityPattern>> {
        self.patterns.read().clone()
    }

    /// Replace the pattern list; events already being analyzed keep the old list.
    pub fn set_patterns(&self, patterns: Vec<SecurityPattern>) {
        *self.patterns.write() = Arc::new(patterns);
    }

    /// Run every pattern against `event`, returning the alerts raised.
    pub async fn analyze(&self, event: &SecurityEvent) -> Vec<SecurityAlert> {
        let patterns = self.patterns();
        let mut raised = Vec::new();
        for pattern in patterns.iter() {
            if !pattern.trigger.matches(event, self.zone) {
                continue;
            }
            if let Some(key) = pattern.correlation.key(event) {
                if self.alerts.has_active(&pattern.id, key) {
                    debug!(pattern = %pattern.id, key, "active alert already covers key");
                    continue;
                }
            }
            let count = if pattern.correlation == Correlation::Point {
                1
            } else {
                match self.count_in_window(pattern, event).await {
                    Ok(Some(count)) => count,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(
                            pattern = %pattern.id,
                            event_id = event.id,
                            error = %err,
                            "pattern skipped"
                        );
                        continue;
                    }
                }
            };
            if pattern.correlation != Correlation::Point && count < pattern.threshold {
                debug!(
                    pattern = %pattern.id,
                    count,
                    threshold = pattern.threshold,
                    "below threshold"
                );
                continue;
            }
            if let Some(alert) = self.raise(pattern, event, count).await {
                raised.push(alert);
            }
        }
        raised
    }

    async fn count_in_window(
        &self,
        pattern: &SecurityPattern,
        event: &SecurityEvent,
    ) -> Result<Option<usize>, DetectorError> {
        let Some(key) = pattern.correlation.key(event) else {
            return Ok(None);
        };
        let mut filter = EventFilter {
            event_type: pattern.trigger.event_type().map(str::to_owned),
            since: Some(event.timestamp - chrono::Duration::minutes(pattern.window_minutes)),
            until: Some(event.timestamp),
            ..EventFilter::default()
        };
        match pattern.correlation {
            Correlation::SourceIp => filter.source_ip = Some(key.to_owned()),
            Correlation::Subject => filter.subject_id = Some(key.to_owned()),
            Correlation::Point => {}
        }

        let history = tokio::time::timeout(
            self.query_timeout,
            self.event_log.query(&filter, HISTORY_LIMIT),
        )
        .await
        .map_err(|_| DetectorError::Timeout(self.query_timeout))??;

        let anchor = event.ordering_key();
        Ok(Some(
            history
                .iter()
                .filter(|candidate| candidate.ordering_key() <= anchor)
                .filter(|candidate| pattern.trigger.matches(candidate, self.zone))
                .count(),
        ))
    }

    async fn raise(
        &self,
        pattern: &SecurityPattern,
        event: &SecurityEvent,
        count: usize,
    ) -> Option<SecurityAlert> {
        let description = if pattern.correlation == Correlation::Point {
            format!("{} (event {})", pattern.title, event.id)
        } else {
            format!(
                "{}: {count} matching events within {} minutes",
                pattern.title, pattern.window_minutes
            )
        };
        let alert = SecurityAlert {
            id: Uuid::new_v4(),
            pattern_id: pattern.id.clone(),
            alert_type: pattern.alert_type,
            severity: pattern.severity,
            title: pattern.title.clone(),
            description,
            subject_id: event.subject_id.clone(),
            source_ip: event.source_ip.clone(),
            correlation_key: pattern.correlation.key(event).map(str::to_owned),
            timestamp: event.timestamp,
            trigger_event: event.id,
            matched_events: count,
            actions: pattern.actions.clone(),
            active: true,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        };
        if !self.alerts.open(alert.clone()) {
            debug!(pattern = %pattern.id, "alert raised concurrently for the same key");
            return None;
        }
        warn!(
            alert_id = %alert.id,
            pattern = %pattern.id,
            severity = %alert.severity,
            source_ip = alert.source_ip.as_deref().unwrap_or("-"),
            subject = alert.subject_id.as_deref().unwrap_or("-"),
            count,
            "security alert raised"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_alert(&pattern.id);
        }

        for callback in self.callbacks.snapshot().iter() {
            if let Err(err) = callback.on_alert(&alert) {
                error!(alert_id = %alert.id, error = %format!("{err:#}"), "alert callback failed");
            }
        }
        self.responder.run_all(&alert, self.clock.now()).await;
        Some(alert)
    }
}

enum Command {
    Analyze(Box<SecurityEvent>),
    Drain(oneshot::Sender<()>),
}

/// Queue in front of a single detector task.
///
/// Submissions are fire-and-forget; the task analyzes them one at a time in
/// submission order. Must be created inside a tokio runtime.
pub struct DetectorHandle {
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DetectorHandle {
    /// Spawn the detector task.
    pub fn spawn(detector: Arc<PatternDetector>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Analyze(event) => {
                        detector.analyze(&event).await;
                    }
                    Command::Drain(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("detector task stopped");
        });
        Self {
            sender: Mutex::new(Some(sender)),
            task: Mutex::new(Some(task)),
        }
    }

    fn send(&self, command: Command) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }

    /// Queue an event for analysis. Returns `false` once the detector has stopped.
    pub fn submit(&self, event: SecurityEvent) -> bool {
        let queued = self.send(Command::Analyze(Box::new(event)));
        if !queued {
            warn!("detector stopped; event not analyzed");
        }
        queued
    }

    /// Wait until every event submitted so far has been analyzed.
    pub async fn drain(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(Command::Drain(ack)) {
            let _ = done.await;
        }
    }

    /// Finish queued work and stop the task.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "detector task ended abnormally");
            }
        }
    }
}
