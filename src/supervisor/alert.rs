//! Alert Dispatch
//!
//! Routes alert-worthy events to the configured sink and broadcasts them
//! to in-process subscribers. Every health or recovery transition that
//! warrants operator attention goes through here; nothing alert-worthy is
//! dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    /// Informational - log only
    Info,
    /// Warning - operator should look eventually
    Warning,
    /// Error - component failed or restore aborted
    Error,
    /// Critical - failover or permanent failure
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub component: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, component: &str, title: &str, message: &str) -> Self {
        Self {
            severity,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Notification sink implemented by out-of-scope collaborators
/// (chat bots, pagers). The default sink logs.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

/// Sink that writes alerts to the tracing log only.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Info => {
                info!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertSeverity::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertSeverity::Error => {
                error!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertSeverity::Critical => error!(
                "CRITICAL [{}] {}: {}",
                alert.component, alert.title, alert.message
            ),
        }
    }
}

/// Dispatcher in front of the sink: forwards every alert and broadcasts a
/// copy to local subscribers.
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self { sink, event_tx }
    }

    /// Subscribe to a copy of every dispatched alert.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    /// Dispatch an alert. The sink always receives it; local subscribers
    /// get a best-effort copy.
    pub async fn dispatch(&self, alert: Alert) {
        let _ = self.event_tx.send(alert.clone());
        self.sink.notify(&alert).await;
    }

    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.dispatch(Alert::new(AlertSeverity::Info, component, title, message))
            .await;
    }

    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.dispatch(Alert::new(
            AlertSeverity::Warning,
            component,
            title,
            message,
        ))
        .await;
    }

    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.dispatch(Alert::new(AlertSeverity::Error, component, title, message))
            .await;
    }

    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.dispatch(Alert::new(
            AlertSeverity::Critical,
            component,
            title,
            message,
        ))
        .await;
    }
}
