// Lifecycle Orchestrator
//
// Turns command intents into validated calls against the resource backend.
// Each command is a short transaction:
//
//   RECEIVED -> VALIDATED -> (CONFIRMING ->)? EXECUTING -> SUCCEEDED | FAILED
//
// Force stop, delete and snapshot rollback stop at CONFIRMING and resume in
// EXECUTING when the matching `confirm` intent arrives. A per-VMID lock keeps
// two transactions on the same guest from executing at once.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compute::ResourceBackend;
use crate::confirmation::{ConfirmationManager, ConfirmationMatch, PendingConfirmation};
use crate::error::{OrchestratorError, Result};
use crate::models::{
    parse_vmid, CommandIntent, CommandOutcome, CommandResult, ConfirmableAction, PowerAction,
    ResourceRef, ResourceState, ResourceStatus, RRD_TIMEFRAMES,
};
use crate::watchlist::WatchListStore;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_cores: u32,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    /// Status polls after the safety stop that precedes a delete
    pub delete_stop_poll_attempts: u32,
    pub delete_stop_poll_interval: Duration,
    pub confirmation_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_cores: 128,
            min_memory_mb: 16,
            max_memory_mb: 1024 * 1024,
            delete_stop_poll_attempts: 15,
            delete_stop_poll_interval: Duration::from_secs(2),
            confirmation_ttl: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    Validated,
    Confirming,
    Executing,
    Succeeded,
    Failed,
}

struct Transaction {
    id: Uuid,
    command: &'static str,
    phase: Phase,
}

impl Transaction {
    fn new(command: &'static str) -> Self {
        let id = Uuid::new_v4();
        debug!("[{}] {} received", id, command);
        Self {
            id,
            command,
            phase: Phase::Received,
        }
    }

    fn advance(&mut self, phase: Phase) {
        debug!("[{}] {}: {:?} -> {:?}", self.id, self.command, self.phase, phase);
        self.phase = phase;
    }
}

/// One async mutex per VMID, created on first use.
#[derive(Default)]
struct ResourceLocks {
    inner: std::sync::Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    async fn acquire(&self, vmid: u32) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(vmid).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct LifecycleOrchestrator {
    backend: Arc<dyn ResourceBackend>,
    watchlist: Arc<WatchListStore>,
    confirmations: ConfirmationManager,
    locks: ResourceLocks,
    settings: OrchestratorSettings,
}

impl LifecycleOrchestrator {
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        watchlist: Arc<WatchListStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            backend,
            watchlist,
            confirmations: ConfirmationManager::new(settings.confirmation_ttl),
            locks: ResourceLocks::default(),
            settings,
        }
    }

    /// Run one command to completion (or to its confirmation prompt).
    pub async fn handle(&self, intent: CommandIntent, requested_by: &str) -> CommandResult {
        let mut tx = Transaction::new(intent.name());
        info!("{} requested {}", requested_by, tx.command);

        match self.dispatch(&mut tx, intent, requested_by).await {
            Ok(result) => {
                if result.outcome == CommandOutcome::Succeeded {
                    tx.advance(Phase::Succeeded);
                }
                result
            }
            Err(e) => {
                tx.advance(Phase::Failed);
                warn!("{} failed: {}", tx.command, e);
                CommandResult::failed(&e)
            }
        }
    }

    /// Housekeeping for confirmations nobody came back for.
    pub async fn purge_expired_confirmations(&self) -> usize {
        let purged = self.confirmations.purge_expired(Utc::now()).await;
        if purged > 0 {
            info!("Discarded {} expired confirmations", purged);
        }
        purged
    }

    async fn dispatch(
        &self,
        tx: &mut Transaction,
        intent: CommandIntent,
        requested_by: &str,
    ) -> Result<CommandResult> {
        match intent {
            CommandIntent::List => self.list_resources().await,
            CommandIntent::Info { vmid } => self.info(parse_vmid(vmid)?).await,
            CommandIntent::Start { vmid } => self.power(tx, parse_vmid(vmid)?, PowerAction::Start).await,
            CommandIntent::Reboot { vmid } => self.power(tx, parse_vmid(vmid)?, PowerAction::Reboot).await,
            CommandIntent::Shutdown { vmid } => {
                self.power(tx, parse_vmid(vmid)?, PowerAction::Shutdown).await
            }
            CommandIntent::Stop { vmid } => {
                self.request_confirmation(tx, parse_vmid(vmid)?, ConfirmableAction::Stop, None, requested_by)
                    .await
            }
            CommandIntent::Delete { vmid } => {
                self.request_confirmation(tx, parse_vmid(vmid)?, ConfirmableAction::Delete, None, requested_by)
                    .await
            }
            CommandIntent::SnapshotRollback { vmid, name } => {
                validate_snapshot_name(&name)?;
                self.request_confirmation(
                    tx,
                    parse_vmid(vmid)?,
                    ConfirmableAction::Rollback,
                    Some(name),
                    requested_by,
                )
                .await
            }
            CommandIntent::Confirm { token, vmid, confirm_action } => {
                let expected = ConfirmationMatch {
                    vmid: vmid.map(parse_vmid).transpose()?,
                    action: confirm_action,
                };
                self.confirm(tx, &token, expected).await
            }
            CommandIntent::Cancel { token } => {
                let record = self.confirmations.cancel(&token).await?;
                Ok(CommandResult::succeeded(
                    format!("Cancelled {} of {}", record.action, record.resource),
                    json!({ "resource": record.resource, "action": record.action }),
                ))
            }
            CommandIntent::Create { template_id, new_vmid, name } => {
                self.create(tx, parse_vmid(template_id)?, parse_vmid(new_vmid)?, &name)
                    .await
            }
            CommandIntent::Resize { vmid, cores, memory_mb } => {
                self.resize(tx, parse_vmid(vmid)?, cores, memory_mb).await
            }
            CommandIntent::SnapshotCreate { vmid, name } => {
                self.snapshot_create(tx, parse_vmid(vmid)?, &name).await
            }
            CommandIntent::SnapshotList { vmid } => self.snapshot_list(parse_vmid(vmid)?).await,
            CommandIntent::Metrics { vmid, timeframe } => {
                self.metrics(parse_vmid(vmid)?, &timeframe).await
            }
            CommandIntent::MonitorAdd { vmid } => self.monitor_add(parse_vmid(vmid)?).await,
            CommandIntent::MonitorRemove { vmid } => self.monitor_remove(parse_vmid(vmid)?).await,
            CommandIntent::MonitorList => self.monitor_list().await,
        }
    }

    // ==================== Validation helpers ====================

    /// Resolve the kind of `vmid` and fetch its current state.
    async fn resolve(&self, vmid: u32) -> Result<ResourceState> {
        let resource = self
            .backend
            .locate(vmid)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("VMID {} not found", vmid)))?;
        self.backend.get(resource).await
    }

    /// Best-effort read after a mutation; failures only cost the details.
    async fn observe(&self, resource: ResourceRef) -> Option<ResourceState> {
        match self.backend.get(resource).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Could not read back {} after action: {}", resource, e);
                None
            }
        }
    }

    // ==================== Read-only commands ====================

    async fn list_resources(&self) -> Result<CommandResult> {
        let resources = self.backend.list().await?;
        Ok(CommandResult::succeeded(
            format!("{} resources on the node", resources.len()),
            json!({ "resources": resources }),
        ))
    }

    async fn info(&self, vmid: u32) -> Result<CommandResult> {
        let state = self.resolve(vmid).await?;
        let mut message = format!(
            "{} ({}) is {}, {} cores, {} MB",
            state.resource, state.name, state.status, state.cpu_cores, state.memory_mb
        );
        if let (Some(cpu), Some(used)) = (state.cpu_usage, state.memory_used_mb) {
            message.push_str(&format!(", using {:.1}% CPU and {} MB", cpu * 100.0, used));
        }
        Ok(CommandResult::succeeded(message, json!({ "state": state })))
    }

    async fn snapshot_list(&self, vmid: u32) -> Result<CommandResult> {
        let state = self.resolve(vmid).await?;
        let snapshots = self.backend.snapshot_list(state.resource).await?;
        let message = if snapshots.is_empty() {
            format!("{} has no snapshots", state.resource)
        } else {
            format!("{} has {} snapshots", state.resource, snapshots.len())
        };
        Ok(CommandResult::succeeded(message, json!({ "snapshots": snapshots })))
    }

    async fn metrics(&self, vmid: u32, timeframe: &str) -> Result<CommandResult> {
        if !RRD_TIMEFRAMES.contains(&timeframe) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "timeframe must be one of {}, got '{}'",
                RRD_TIMEFRAMES.join(", "),
                timeframe
            )));
        }
        let state = self.resolve(vmid).await?;
        let points = self.backend.rrd_data(state.resource, timeframe).await?;
        if points.is_empty() {
            return Err(OrchestratorError::NotFound(format!(
                "no metrics for {} over the last {}",
                state.resource, timeframe
            )));
        }

        let cpu: Vec<f64> = points.iter().filter_map(|p| p.cpu).collect();
        let avg_cpu_percent = if cpu.is_empty() {
            0.0
        } else {
            cpu.iter().sum::<f64>() / cpu.len() as f64 * 100.0
        };
        let peak_memory_mb = points
            .iter()
            .filter_map(|p| p.mem)
            .fold(0.0_f64, f64::max)
            / (1024.0 * 1024.0);

        Ok(CommandResult::succeeded(
            format!("{} ({}) over the last {}", state.resource, state.name, timeframe),
            json!({
                "timeframe": timeframe,
                "avg_cpu_percent": avg_cpu_percent,
                "peak_memory_mb": peak_memory_mb,
                "points": points,
            }),
        ))
    }

    // ==================== Lifecycle commands ====================

    async fn power(&self, tx: &mut Transaction, vmid: u32, action: PowerAction) -> Result<CommandResult> {
        let _lock = self.locks.acquire(vmid).await;
        let state = self.resolve(vmid).await?;
        tx.advance(Phase::Validated);

        if action == PowerAction::Start && state.status == ResourceStatus::Running {
            return Ok(CommandResult::succeeded(
                format!("{} is already running", state.resource),
                json!({ "state": state }),
            ));
        }

        tx.advance(Phase::Executing);
        self.backend.power(state.resource, action).await?;

        let message = match action {
            PowerAction::Start => format!("▶️ Started {}", state.resource),
            PowerAction::Reboot => format!("🔄 Rebooting {}", state.resource),
            PowerAction::Shutdown => format!("🛑 Sent ACPI shutdown to {}", state.resource),
            PowerAction::Stop => format!("⚡ Force stopped {}", state.resource),
        };
        let observed = self.observe(state.resource).await;
        Ok(CommandResult::succeeded(message, json!({ "state": observed })))
    }

    async fn create(
        &self,
        tx: &mut Transaction,
        template_id: u32,
        new_vmid: u32,
        name: &str,
    ) -> Result<CommandResult> {
        validate_guest_name(name)?;
        if template_id == new_vmid {
            return Err(OrchestratorError::InvalidArgument(
                "new VMID must differ from the template VMID".to_string(),
            ));
        }

        let _lock = self.locks.acquire(new_vmid).await;
        let template = self
            .backend
            .locate(template_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("template VMID {} not found", template_id)))?;
        if self.backend.locate(new_vmid).await?.is_some() {
            return Err(OrchestratorError::InvalidArgument(format!(
                "VMID {} is already in use",
                new_vmid
            )));
        }
        tx.advance(Phase::Validated);

        tx.advance(Phase::Executing);
        let task = self.backend.create(template, new_vmid, name).await?;
        Ok(CommandResult::succeeded(
            format!(
                "✅ Creating '{}' (VMID {}) from template {}. Start it with the start command once the clone finishes.",
                name, new_vmid, template_id
            ),
            json!({ "vmid": new_vmid, "template": template, "task": task }),
        ))
    }

    async fn resize(
        &self,
        tx: &mut Transaction,
        vmid: u32,
        cores: i64,
        memory_mb: i64,
    ) -> Result<CommandResult> {
        let cores = u32::try_from(cores)
            .ok()
            .filter(|c| (1..=self.settings.max_cores).contains(c))
            .ok_or_else(|| {
                OrchestratorError::InvalidArgument(format!(
                    "cores must be between 1 and {}, got {}",
                    self.settings.max_cores, cores
                ))
            })?;
        let memory_mb = u64::try_from(memory_mb)
            .ok()
            .filter(|m| (self.settings.min_memory_mb..=self.settings.max_memory_mb).contains(m))
            .ok_or_else(|| {
                OrchestratorError::InvalidArgument(format!(
                    "memory must be between {} and {} MB, got {}",
                    self.settings.min_memory_mb, self.settings.max_memory_mb, memory_mb
                ))
            })?;

        let _lock = self.locks.acquire(vmid).await;
        let state = self.resolve(vmid).await?;
        tx.advance(Phase::Validated);

        tx.advance(Phase::Executing);
        self.backend.resize(state.resource, cores, memory_mb).await?;

        let observed = self.observe(state.resource).await;
        Ok(CommandResult::succeeded(
            format!(
                "⚙️ {} set to {} cores, {} MB. Changes apply after the next restart.",
                state.resource, cores, memory_mb
            ),
            json!({ "cores": cores, "memory_mb": memory_mb, "state": observed }),
        ))
    }

    async fn snapshot_create(&self, tx: &mut Transaction, vmid: u32, name: &str) -> Result<CommandResult> {
        validate_snapshot_name(name)?;

        let _lock = self.locks.acquire(vmid).await;
        let state = self.resolve(vmid).await?;
        tx.advance(Phase::Validated);

        tx.advance(Phase::Executing);
        self.backend.snapshot_create(state.resource, name).await?;
        Ok(CommandResult::succeeded(
            format!("📸 Created snapshot '{}' of {}", name, state.resource),
            json!({ "resource": state.resource, "snapshot": name }),
        ))
    }

    // ==================== Confirmation flow ====================

    async fn request_confirmation(
        &self,
        tx: &mut Transaction,
        vmid: u32,
        action: ConfirmableAction,
        snapshot: Option<String>,
        requested_by: &str,
    ) -> Result<CommandResult> {
        let _lock = self.locks.acquire(vmid).await;
        let state = self.resolve(vmid).await?;

        if let Some(name) = &snapshot {
            let snapshots = self.backend.snapshot_list(state.resource).await?;
            if !snapshots.iter().any(|s| &s.name == name) {
                return Err(OrchestratorError::NotFound(format!(
                    "snapshot '{}' of {} not found",
                    name, state.resource
                )));
            }
        }
        tx.advance(Phase::Validated);

        tx.advance(Phase::Confirming);
        let record = self
            .confirmations
            .request(state.resource, action, snapshot, requested_by)
            .await;

        let prompt = match action {
            ConfirmableAction::Stop => format!(
                "⚠️ Force stop {} ({})? Unsaved data may be lost.",
                state.resource, state.name
            ),
            ConfirmableAction::Delete => format!(
                "⚠️ Delete {} ({})? This destroys the guest and its disks.",
                state.resource, state.name
            ),
            ConfirmableAction::Rollback => format!(
                "⚠️ Roll {} back to snapshot '{}'? The current state will be lost.",
                state.resource,
                record.snapshot.as_deref().unwrap_or_default()
            ),
        };

        Ok(CommandResult::pending(
            format!("{} Confirm before {}.", prompt, record.expires_at.format("%H:%M:%S UTC")),
            record.token.clone(),
            json!({ "pending": record }),
        ))
    }

    async fn confirm(
        &self,
        tx: &mut Transaction,
        token: &str,
        expected: ConfirmationMatch,
    ) -> Result<CommandResult> {
        let record = self.confirmations.confirm(token, expected).await?;
        info!(
            "Confirmed {} of {} (requested by {})",
            record.action, record.resource, record.requested_by
        );

        let _lock = self.locks.acquire(record.resource.vmid).await;
        tx.advance(Phase::Executing);
        self.execute_confirmed(&record).await
    }

    async fn execute_confirmed(&self, record: &PendingConfirmation) -> Result<CommandResult> {
        let resource = record.resource;
        match record.action {
            ConfirmableAction::Stop => {
                self.backend.power(resource, PowerAction::Stop).await?;
                let observed = self.observe(resource).await;
                Ok(CommandResult::succeeded(
                    format!("⚡ Force stopped {}", resource),
                    json!({ "state": observed }),
                ))
            }
            ConfirmableAction::Delete => {
                self.delete_safely(resource).await?;
                let message = if self.watchlist.contains(resource.vmid) {
                    format!("🗑️ Deleted {}. It is still on the watch-list.", resource)
                } else {
                    format!("🗑️ Deleted {}", resource)
                };
                Ok(CommandResult::succeeded(message, json!({ "resource": resource })))
            }
            ConfirmableAction::Rollback => {
                let name = record.snapshot.as_deref().ok_or_else(|| {
                    OrchestratorError::InvalidArgument("rollback without snapshot name".to_string())
                })?;
                self.backend.snapshot_rollback(resource, name).await?;
                Ok(CommandResult::succeeded(
                    format!("✅ Rolled {} back to '{}'", resource, name),
                    json!({ "resource": resource, "snapshot": name }),
                ))
            }
        }
    }

    /// Delete only once the guest is confirmed stopped.
    async fn delete_safely(&self, resource: ResourceRef) -> Result<()> {
        let state = self.backend.get(resource).await?;
        if state.status != ResourceStatus::Stopped {
            info!("{} is {}, stopping before delete", resource, state.status);
            self.backend.power(resource, PowerAction::Stop).await?;
            self.wait_until_stopped(resource).await?;
        }
        self.backend.delete(resource).await
    }

    async fn wait_until_stopped(&self, resource: ResourceRef) -> Result<()> {
        for attempt in 1..=self.settings.delete_stop_poll_attempts {
            tokio::time::sleep(self.settings.delete_stop_poll_interval).await;
            match self.backend.get(resource).await {
                Ok(state) if state.status == ResourceStatus::Stopped => return Ok(()),
                Ok(state) => debug!("{} still {} (poll {})", resource, state.status, attempt),
                Err(e) if e.is_retryable() => debug!("Poll {} for {} failed: {}", attempt, resource, e),
                Err(e) => return Err(e),
            }
        }
        Err(OrchestratorError::PreconditionFailed(format!(
            "{} did not stop after {} checks, delete aborted",
            resource, self.settings.delete_stop_poll_attempts
        )))
    }

    // ==================== Watch-list commands ====================

    async fn monitor_add(&self, vmid: u32) -> Result<CommandResult> {
        if self.watchlist.contains(vmid) {
            return Ok(CommandResult::succeeded(
                format!("VMID {} is already monitored", vmid),
                json!({ "vmid": vmid, "added": false }),
            ));
        }
        let state = self.resolve(vmid).await?;
        let added = self.watchlist.add(vmid).await?;
        Ok(CommandResult::succeeded(
            format!("✅ Monitoring {} ({})", state.resource, state.name),
            json!({ "vmid": vmid, "added": added }),
        ))
    }

    async fn monitor_remove(&self, vmid: u32) -> Result<CommandResult> {
        let removed = self.watchlist.remove(vmid).await?;
        let message = if removed {
            format!("🗑️ Stopped monitoring VMID {}", vmid)
        } else {
            format!("VMID {} is not monitored", vmid)
        };
        Ok(CommandResult::succeeded(message, json!({ "vmid": vmid, "removed": removed })))
    }

    async fn monitor_list(&self) -> Result<CommandResult> {
        let watched = self.watchlist.list();
        if watched.is_empty() {
            return Ok(CommandResult::succeeded(
                "No resources are monitored",
                json!({ "entries": [] }),
            ));
        }

        // Names are cosmetic; an unreachable API still yields the bare list
        let listing: HashMap<u32, _> = match self.backend.list().await {
            Ok(items) => items.into_iter().map(|s| (s.resource.vmid, s)).collect(),
            Err(e) => {
                warn!("Could not resolve monitored resource names: {}", e);
                HashMap::new()
            }
        };

        let entries: Vec<serde_json::Value> = watched
            .iter()
            .map(|vmid| match listing.get(vmid) {
                Some(summary) => json!({
                    "vmid": vmid,
                    "name": summary.name,
                    "kind": summary.resource.kind,
                    "status": summary.status,
                    "present": true,
                }),
                None => json!({ "vmid": vmid, "present": false }),
            })
            .collect();

        Ok(CommandResult::succeeded(
            format!("{} monitored resources", entries.len()),
            json!({ "entries": entries }),
        ))
    }
}

/// Proxmox snapshot names: a letter followed by letters, digits, '-' or '_'.
fn validate_snapshot_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = name.len() >= 2
        && name.len() <= 40
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidArgument(format!(
            "invalid snapshot name '{}': use 2-40 letters, digits, '-' or '_', starting with a letter",
            name
        )))
    }
}

/// Guest names must be valid DNS names.
fn validate_guest_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidArgument(format!(
            "invalid guest name '{}': use letters, digits, '-' and '.'",
            name
        )))
    }
}
