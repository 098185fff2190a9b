//! user-visible notifications
//!
//! the finalizer, session and proposal executor report progress through an
//! [`AlertSink`]; a ui drains a channel, a cli logs them.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertKind {
    Info,
    Success,
    Error,
    /// not a failure, e.g. the user declined a signature
    Neutral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub description: Option<String>,
    pub tx_hash: Option<String>,
    pub timeout: Option<Duration>,
}

impl Alert {
    fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            description: None,
            tx_hash: None,
            timeout: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(AlertKind::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(AlertKind::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(AlertKind::Error, message)
    }

    pub fn neutral(message: impl Into<String>) -> Self {
        Self::new(AlertKind::Neutral, message)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub trait AlertSink: Send + Sync {
    fn push(&self, alert: Alert);
}

/// writes alerts to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn push(&self, alert: Alert) {
        let description = alert.description.as_deref().unwrap_or("");
        match alert.kind {
            AlertKind::Info | AlertKind::Neutral => {
                tracing::info!(tx = ?alert.tx_hash, "{} {}", alert.message, description)
            }
            AlertKind::Success => {
                tracing::info!(tx = ?alert.tx_hash, "✓ {} {}", alert.message, description)
            }
            AlertKind::Error => {
                tracing::error!(tx = ?alert.tx_hash, "{} {}", alert.message, description)
            }
        }
    }
}

/// forwards alerts to a consumer task
#[derive(Clone, Debug)]
pub struct ChannelAlerts {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlerts {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlerts {
    fn push(&self, alert: Alert) {
        // receiver gone means nobody is displaying alerts anymore
        let _ = self.tx.send(alert);
    }
}

/// keeps every alert in memory
#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|a| a.message).collect()
    }
}

impl AlertSink for AlertLog {
    fn push(&self, alert: Alert) {
        self.alerts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let alert = Alert::success("Proposal executed")
            .with_description("The transaction has been validated")
            .with_tx_hash("0xabc");
        assert_eq!(alert.kind, AlertKind::Success);
        assert_eq!(alert.tx_hash.as_deref(), Some("0xabc"));
        assert!(alert.timeout.is_none());
    }

    #[tokio::test]
    async fn test_channel_alerts() {
        let (sink, mut rx) = ChannelAlerts::new();
        sink.push(Alert::info("Merging poll..."));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.message, "Merging poll...");

        drop(rx);
        // no panic once the consumer is gone
        sink.push(Alert::info("ignored"));
    }

    #[test]
    fn test_alert_log() {
        let log = AlertLog::new();
        log.push(Alert::error("a"));
        log.push(Alert::neutral("b"));
        assert_eq!(log.messages(), vec!["a", "b"]);
    }
}
