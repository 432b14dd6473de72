// Alert events and the sinks that carry them out of the monitor

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::models::{ResourceRef, ResourceStatus};

/// A resource crossed into a down state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub resource: ResourceRef,
    pub name: String,
    /// `None` on the first observation after startup or re-add
    pub previous_status: Option<ResourceStatus>,
    pub current_status: ResourceStatus,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    StateChanged(AlertRecord),
    /// A watched VMID is gone from the node
    ResourceMissing { vmid: u32, detected_at: DateTime<Utc> },
}

impl MonitorEvent {
    /// Human-readable line for the operator channel
    pub fn summary(&self) -> String {
        match self {
            MonitorEvent::StateChanged(alert) => format!(
                "🚨 {} ({}) is {}",
                alert.resource, alert.name, alert.current_status
            ),
            MonitorEvent::ResourceMissing { vmid, .. } => {
                format!("⚠️ VMID {} no longer exists on the node", vmid)
            }
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, event: MonitorEvent);
}

/// Logs every event at warn level.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn deliver(&self, event: MonitorEvent) {
        warn!("{}", event.summary());
    }
}

/// Hands events to whoever holds the receiving end.
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<MonitorEvent>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn deliver(&self, event: MonitorEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("Alert receiver dropped, lost event: {}", e.0.summary());
        }
    }
}
