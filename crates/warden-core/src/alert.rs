//! Alert sink seam
//!
//! Outbound notifications are fire-and-forget: a sink failure is logged and
//! never propagates back into core logic or blocks a pending stop.

use crate::compliance::{AlertSeverity, ComplianceAlert};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Receiver for compliance and operational notifications
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one notification
    async fn notify(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<()>;
}

/// Sink that writes notifications to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    async fn notify(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<()> {
        match severity {
            AlertSeverity::Info => info!(%severity, title, ?context, "{message}"),
            AlertSeverity::Warning => warn!(%severity, title, ?context, "{message}"),
            AlertSeverity::Critical | AlertSeverity::Violation => {
                error!(%severity, title, ?context, "{message}")
            }
        }
        Ok(())
    }
}

/// Deliver a notification without waiting for the sink. Sink errors are
/// logged, never returned.
pub fn dispatch(
    sink: Arc<dyn AlertSink>,
    severity: AlertSeverity,
    title: impl Into<String>,
    message: impl Into<String>,
    context: HashMap<String, String>,
) {
    let title = title.into();
    let message = message.into();
    tokio::spawn(async move {
        if let Err(err) = sink.notify(severity, &title, &message, &context).await {
            warn!(title, "alert sink failed: {err}");
        }
    });
}

/// Bounded in-memory history of compliance alerts, oldest evicted first
#[derive(Debug)]
pub struct AlertHistory {
    capacity: usize,
    entries: Mutex<VecDeque<ComplianceAlert>>,
}

impl AlertHistory {
    /// Create a history bound to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an alert, evicting the oldest entry when full
    pub fn push(&self, alert: ComplianceAlert) {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    /// Most recent `n` alerts, newest last
    pub fn recent(&self, n: usize) -> Vec<ComplianceAlert> {
        let entries = self.entries.lock().expect("history lock poisoned");
        entries
            .iter()
            .skip(entries.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    /// Number of retained alerts
    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    /// Whether the history is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
