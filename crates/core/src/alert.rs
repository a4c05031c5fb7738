//! Alert delivery for risk state transitions.
//!
//! Controls call [`dispatch_alert`] after a transition is persisted. Delivery
//! is fire-and-forget: a failing sink is logged and never rolls back or blocks
//! the transition that produced the alert.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::TenantId;

/// Kind of alert raised by a control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    BreakerTripped,
    BreakerHalfOpen,
    BreakerClosed,
    KillSwitchActivated,
    KillSwitchDeactivated,
    DrawdownStatusChanged,
    VolatilityLevelChanged,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertType::BreakerTripped => "BREAKER_TRIPPED",
            AlertType::BreakerHalfOpen => "BREAKER_HALF_OPEN",
            AlertType::BreakerClosed => "BREAKER_CLOSED",
            AlertType::KillSwitchActivated => "KILL_SWITCH_ACTIVATED",
            AlertType::KillSwitchDeactivated => "KILL_SWITCH_DEACTIVATED",
            AlertType::DrawdownStatusChanged => "DRAWDOWN_STATUS_CHANGED",
            AlertType::VolatilityLevelChanged => "VOLATILITY_LEVEL_CHANGED",
        };
        f.write_str(s)
    }
}

/// A notification about a risk state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub tenant_id: TenantId,
    /// Breaker id, kill-switch scope key, drawdown state id or asset id.
    pub entity_id: String,
    /// State the entity moved into (e.g., `"OPEN"`).
    pub new_state: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Destination for alerts (pager, chat, queue, ...).
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Must not block for long; implementations that
    /// cross the network should hand off to a background task.
    fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Deliver an alert, logging instead of propagating failures.
pub fn dispatch_alert(sink: &dyn AlertSink, alert: Alert) {
    if let Err(e) = sink.send(&alert) {
        tracing::warn!(
            alert_type = %alert.alert_type,
            tenant_id = %alert.tenant_id,
            entity_id = %alert.entity_id,
            error = %e,
            "alert delivery failed"
        );
    }
}

/// Sink that only writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        tracing::info!(
            alert_type = %alert.alert_type,
            tenant_id = %alert.tenant_id,
            entity_id = %alert.entity_id,
            new_state = %alert.new_state,
            reason = ?alert.reason,
            "risk alert"
        );
        Ok(())
    }
}

/// Sink that hands alerts to a bounded channel drained by a notifier task.
///
/// Uses `try_send`, so a full or closed channel fails immediately instead of
/// stalling the control that raised the alert.
pub struct ChannelAlertSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelAlertSink {
    /// Create a sink and the receiver the notifier task should drain.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        self.tx
            .try_send(alert.clone())
            .map_err(|e| anyhow::anyhow!("alert channel unavailable: {}", e))
    }
}

/// Sink that records every alert in memory. Useful for tests and replays.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `send` fail (alerts are still recorded).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    /// Snapshot of recorded alerts.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Recorded alerts of one type.
    pub fn alerts_of(&self, alert_type: AlertType) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.alert_type == alert_type)
            .cloned()
            .collect()
    }
}

impl AlertSink for RecordingAlertSink {
    fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert.clone());
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("sink configured to fail");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_alert() -> Alert {
        Alert {
            alert_type: AlertType::BreakerTripped,
            tenant_id: TenantId::new("acme"),
            entity_id: "cb-1".into(),
            new_state: "OPEN".into(),
            reason: Some("loss rate".into()),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_recording_sink_records() {
        let sink = RecordingAlertSink::new();
        dispatch_alert(&sink, make_alert());
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.alerts_of(AlertType::BreakerTripped).len(), 1);
        assert!(sink.alerts_of(AlertType::BreakerClosed).is_empty());
    }

    #[test]
    fn test_dispatch_swallows_failures() {
        let sink = RecordingAlertSink::new();
        sink.set_failing(true);
        // Must not panic or propagate.
        dispatch_alert(&sink, make_alert());
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn test_channel_sink_full_fails_fast() {
        let (sink, mut rx) = ChannelAlertSink::new(1);
        assert!(sink.send(&make_alert()).is_ok());
        assert!(sink.send(&make_alert()).is_err());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_channel_sink_closed_fails() {
        let (sink, rx) = ChannelAlertSink::new(4);
        drop(rx);
        assert!(sink.send(&make_alert()).is_err());
    }

    #[test]
    fn test_alert_type_display() {
        assert_eq!(AlertType::BreakerTripped.to_string(), "BREAKER_TRIPPED");
        assert_eq!(
            AlertType::KillSwitchActivated.to_string(),
            "KILL_SWITCH_ACTIVATED"
        );
    }
}
