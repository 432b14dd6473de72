// Domain types shared by the client, orchestrator and monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorKind, OrchestratorError, Result};

/// Guest flavour. Serialized with the Proxmox path segment so API payloads
/// can be deserialized directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "qemu", alias = "vm")]
    Vm,
    #[serde(rename = "lxc", alias = "container", alias = "ct")]
    Container,
}

impl ResourceKind {
    /// Path segment under `/nodes/{node}/`
    pub fn api_path(&self) -> &'static str {
        match self {
            ResourceKind::Vm => "qemu",
            ResourceKind::Container => "lxc",
        }
    }

    pub fn from_api_type(value: &str) -> Option<Self> {
        match value {
            "qemu" => Some(ResourceKind::Vm),
            "lxc" => Some(ResourceKind::Container),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub vmid: u32,
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn new(vmid: u32, kind: ResourceKind) -> Self {
        Self { vmid, kind }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Vm => write!(f, "VM {}", self.vmid),
            ResourceKind::Container => write!(f, "CT {}", self.vmid),
        }
    }
}

/// Check that a VMID from an intent is a positive integer the API can address.
pub fn parse_vmid(raw: i64) -> Result<u32> {
    if raw <= 0 {
        return Err(OrchestratorError::InvalidArgument(format!(
            "VMID must be a positive integer, got {}",
            raw
        )));
    }
    u32::try_from(raw).map_err(|_| {
        OrchestratorError::InvalidArgument(format!("VMID {} is out of range", raw))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl ResourceStatus {
    /// Map `status` (and the QEMU-only `qmpstatus`) from the API.
    pub fn from_api(status: &str, qmpstatus: Option<&str>) -> Self {
        match (status, qmpstatus) {
            ("running", Some("paused")) | ("running", Some("suspended")) => ResourceStatus::Paused,
            ("running", _) => ResourceStatus::Running,
            ("stopped", _) => ResourceStatus::Stopped,
            ("paused", _) => ResourceStatus::Paused,
            _ => ResourceStatus::Unknown,
        }
    }

    /// Down states are the ones the monitor alerts on.
    pub fn is_down(&self) -> bool {
        matches!(self, ResourceStatus::Stopped | ResourceStatus::Unknown)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Running => "running",
            ResourceStatus::Stopped => "stopped",
            ResourceStatus::Paused => "paused",
            ResourceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Observed state of one resource at query time. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub resource: ResourceRef,
    pub name: String,
    pub status: ResourceStatus,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub uptime_seconds: u64,
    /// Current CPU load as a fraction of the allotted cores
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_used_mb: Option<u64>,
}

/// One row of the node-wide listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub resource: ResourceRef,
    pub name: String,
    pub status: ResourceStatus,
    pub node: String,
    pub max_cpu: u32,
    pub max_memory_mb: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Reboot,
    Shutdown,
    Stop,
}

impl PowerAction {
    /// Endpoint under `.../status/`
    pub fn endpoint(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Reboot => "reboot",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Stop => "stop",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// Actions that require an explicit second step from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmableAction {
    Stop,
    Delete,
    Rollback,
}

impl fmt::Display for ConfirmableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfirmableAction::Stop => "force stop",
            ConfirmableAction::Delete => "delete",
            ConfirmableAction::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub resource: ResourceRef,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
}

/// One RRD sample as returned by `.../rrddata`. Fields are absent for
/// intervals where the guest was not running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RrdPoint {
    pub time: i64,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub mem: Option<f64>,
    #[serde(default)]
    pub maxmem: Option<f64>,
    #[serde(default)]
    pub netin: Option<f64>,
    #[serde(default)]
    pub netout: Option<f64>,
}

pub const RRD_TIMEFRAMES: &[&str] = &["hour", "day", "week", "month", "year"];

// ==================== Command boundary ====================

/// A parsed operator command. The chat layer produces these; how they are
/// typed or rendered is not our concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandIntent {
    List,
    Info { vmid: i64 },
    Start { vmid: i64 },
    Reboot { vmid: i64 },
    Shutdown { vmid: i64 },
    Stop { vmid: i64 },
    Delete { vmid: i64 },
    Create {
        template_id: i64,
        new_vmid: i64,
        name: String,
    },
    Resize {
        vmid: i64,
        cores: i64,
        memory_mb: i64,
    },
    SnapshotCreate { vmid: i64, name: String },
    SnapshotList { vmid: i64 },
    SnapshotRollback { vmid: i64, name: String },
    Metrics {
        vmid: i64,
        #[serde(default = "default_timeframe")]
        timeframe: String,
    },
    Confirm {
        token: String,
        #[serde(default)]
        vmid: Option<i64>,
        #[serde(default)]
        confirm_action: Option<ConfirmableAction>,
    },
    Cancel { token: String },
    MonitorAdd { vmid: i64 },
    MonitorRemove { vmid: i64 },
    MonitorList,
}

fn default_timeframe() -> String {
    "hour".to_string()
}

impl CommandIntent {
    /// Short verb for logs.
    pub fn name(&self) -> &'static str {
        match self {
            CommandIntent::List => "list",
            CommandIntent::Info { .. } => "info",
            CommandIntent::Start { .. } => "start",
            CommandIntent::Reboot { .. } => "reboot",
            CommandIntent::Shutdown { .. } => "shutdown",
            CommandIntent::Stop { .. } => "stop",
            CommandIntent::Delete { .. } => "delete",
            CommandIntent::Create { .. } => "create",
            CommandIntent::Resize { .. } => "resize",
            CommandIntent::SnapshotCreate { .. } => "snapshot_create",
            CommandIntent::SnapshotList { .. } => "snapshot_list",
            CommandIntent::SnapshotRollback { .. } => "snapshot_rollback",
            CommandIntent::Metrics { .. } => "metrics",
            CommandIntent::Confirm { .. } => "confirm",
            CommandIntent::Cancel { .. } => "cancel",
            CommandIntent::MonitorAdd { .. } => "monitor_add",
            CommandIntent::MonitorRemove { .. } => "monitor_remove",
            CommandIntent::MonitorList => "monitor_list",
        }
    }
}

/// Wire envelope: the intent plus who issued it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentEnvelope {
    /// Echoed back on the result so callers can match replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default = "default_requester")]
    pub requested_by: String,
    #[serde(flatten)]
    pub intent: CommandIntent,
}

fn default_requester() -> String {
    "operator".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOutcome {
    Succeeded,
    Failed,
    PendingConfirmation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub outcome: CommandOutcome,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl CommandResult {
    pub fn succeeded(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            request_id: None,
            outcome: CommandOutcome::Succeeded,
            message: message.into(),
            error: None,
            token: None,
            details,
        }
    }

    pub fn failed(err: &OrchestratorError) -> Self {
        Self {
            request_id: None,
            outcome: CommandOutcome::Failed,
            message: err.to_string(),
            error: Some(err.kind()),
            token: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn pending(message: impl Into<String>, token: String, details: serde_json::Value) -> Self {
        Self {
            request_id: None,
            outcome: CommandOutcome::PendingConfirmation,
            message: message.into(),
            error: None,
            token: Some(token),
            details,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}
