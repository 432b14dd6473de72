// In-memory backend for unit tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::compute::ResourceBackend;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    PowerAction, ResourceKind, ResourceRef, ResourceState, ResourceStatus, ResourceSummary,
    RrdPoint, Snapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(u32),
    Create(u32, u32),
    Resize(u32, u32, u64),
    Power(u32, PowerAction),
    Delete(u32),
    SnapshotCreate(u32, String),
    SnapshotRollback(u32, String),
}

#[derive(Default)]
pub struct FakeBackend {
    resources: Mutex<HashMap<u32, (ResourceState, Vec<String>)>>,
    calls: Mutex<Vec<Call>>,
    failing_gets: Mutex<HashSet<u32>>,
    pub list_fails: AtomicBool,
    /// When set a Stop leaves the guest running
    stop_ignored: AtomicBool,
    /// Parks `get` until notified
    get_gate: Mutex<Option<Arc<Notify>>>,
    op_delay: Mutex<Option<Duration>>,
    in_flight: Mutex<HashMap<u32, usize>>,
    pub max_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, vmid: u32, status: ResourceStatus) -> Self {
        self.insert(ResourceRef::new(vmid, ResourceKind::Vm), status);
        self
    }

    pub fn with_container(self, vmid: u32, status: ResourceStatus) -> Self {
        self.insert(ResourceRef::new(vmid, ResourceKind::Container), status);
        self
    }

    pub fn with_snapshot(self, vmid: u32, name: &str) -> Self {
        if let Some((_, snaps)) = self.resources.lock().unwrap().get_mut(&vmid) {
            snaps.push(name.to_string());
        }
        self
    }

    pub fn insert(&self, resource: ResourceRef, status: ResourceStatus) {
        let state = ResourceState {
            resource,
            name: format!("guest-{}", resource.vmid),
            status,
            cpu_cores: 2,
            memory_mb: 2048,
            uptime_seconds: 0,
            cpu_usage: Some(0.05),
            memory_used_mb: Some(512),
        };
        self.resources
            .lock()
            .unwrap()
            .insert(resource.vmid, (state, Vec::new()));
    }

    pub fn set_status(&self, vmid: u32, status: ResourceStatus) {
        if let Some((state, _)) = self.resources.lock().unwrap().get_mut(&vmid) {
            state.status = status;
        }
    }

    pub fn remove(&self, vmid: u32) {
        self.resources.lock().unwrap().remove(&vmid);
    }

    pub fn fail_get(&self, vmid: u32, fail: bool) {
        let mut failing = self.failing_gets.lock().unwrap();
        if fail {
            failing.insert(vmid);
        } else {
            failing.remove(&vmid);
        }
    }

    pub fn ignore_stop(&self) {
        self.stop_ignored.store(true, Ordering::SeqCst);
    }

    pub fn gate_gets(&self, gate: Arc<Notify>) {
        *self.get_gate.lock().unwrap() = Some(gate);
    }

    pub fn slow_ops(&self, delay: Duration) {
        *self.op_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than status reads
    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Get(_)))
            .collect()
    }

    pub fn exists(&self, vmid: u32) -> bool {
        self.resources.lock().unwrap().contains_key(&vmid)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn lookup(&self, resource: ResourceRef) -> Result<ResourceState> {
        self.resources
            .lock()
            .unwrap()
            .get(&resource.vmid)
            .map(|(state, _)| state.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} does not exist", resource)))
    }

    /// Track overlapping mutating calls per VMID while `delay` elapses.
    async fn occupy(&self, vmid: u32) {
        let delay = *self.op_delay.lock().unwrap();
        let Some(delay) = delay else { return };
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(vmid).or_insert(0);
            *count += 1;
            self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
        }
        tokio::time::sleep(delay).await;
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(&vmid) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl ResourceBackend for FakeBackend {
    async fn list(&self) -> Result<Vec<ResourceSummary>> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(OrchestratorError::RemoteUnavailable("connection refused".to_string()));
        }
        let mut out: Vec<ResourceSummary> = self
            .resources
            .lock()
            .unwrap()
            .values()
            .map(|(state, _)| ResourceSummary {
                resource: state.resource,
                name: state.name.clone(),
                status: state.status,
                node: "pve".to_string(),
                max_cpu: state.cpu_cores,
                max_memory_mb: state.memory_mb,
                uptime_seconds: state.uptime_seconds,
            })
            .collect();
        out.sort_by_key(|s| s.resource.vmid);
        Ok(out)
    }

    async fn get(&self, resource: ResourceRef) -> Result<ResourceState> {
        self.record(Call::Get(resource.vmid));
        let gate = self.get_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing_gets.lock().unwrap().contains(&resource.vmid) {
            return Err(OrchestratorError::RemoteUnavailable("timed out".to_string()));
        }
        self.lookup(resource)
    }

    async fn create(&self, template: ResourceRef, new_vmid: u32, name: &str) -> Result<String> {
        self.lookup(template)?;
        self.record(Call::Create(template.vmid, new_vmid));
        if self.exists(new_vmid) {
            return Err(OrchestratorError::RemoteRejected(format!(
                "VM {} already exists",
                new_vmid
            )));
        }
        let resource = ResourceRef::new(new_vmid, template.kind);
        self.insert(resource, ResourceStatus::Stopped);
        if let Some((state, _)) = self.resources.lock().unwrap().get_mut(&new_vmid) {
            state.name = name.to_string();
        }
        Ok(format!("UPID:pve:clone:{}", new_vmid))
    }

    async fn resize(&self, resource: ResourceRef, cores: u32, memory_mb: u64) -> Result<()> {
        self.record(Call::Resize(resource.vmid, cores, memory_mb));
        self.occupy(resource.vmid).await;
        self.lookup(resource)?;
        Ok(())
    }

    async fn power(&self, resource: ResourceRef, action: PowerAction) -> Result<()> {
        self.record(Call::Power(resource.vmid, action));
        self.occupy(resource.vmid).await;
        self.lookup(resource)?;
        let next = match action {
            PowerAction::Start | PowerAction::Reboot => ResourceStatus::Running,
            PowerAction::Shutdown => ResourceStatus::Stopped,
            PowerAction::Stop if self.stop_ignored.load(Ordering::SeqCst) => return Ok(()),
            PowerAction::Stop => ResourceStatus::Stopped,
        };
        self.set_status(resource.vmid, next);
        Ok(())
    }

    async fn delete(&self, resource: ResourceRef) -> Result<()> {
        self.record(Call::Delete(resource.vmid));
        self.occupy(resource.vmid).await;
        self.lookup(resource)?;
        self.remove(resource.vmid);
        Ok(())
    }

    async fn snapshot_create(&self, resource: ResourceRef, name: &str) -> Result<()> {
        self.record(Call::SnapshotCreate(resource.vmid, name.to_string()));
        self.lookup(resource)?;
        if let Some((_, snaps)) = self.resources.lock().unwrap().get_mut(&resource.vmid) {
            snaps.push(name.to_string());
        }
        Ok(())
    }

    async fn snapshot_list(&self, resource: ResourceRef) -> Result<Vec<Snapshot>> {
        let resources = self.resources.lock().unwrap();
        let (_, snaps) = resources
            .get(&resource.vmid)
            .ok_or_else(|| OrchestratorError::NotFound(format!("{} does not exist", resource)))?;
        Ok(snaps
            .iter()
            .map(|name| Snapshot {
                resource,
                name: name.clone(),
                created_at: None,
                description: String::new(),
            })
            .collect())
    }

    async fn snapshot_rollback(&self, resource: ResourceRef, name: &str) -> Result<()> {
        self.record(Call::SnapshotRollback(resource.vmid, name.to_string()));
        self.lookup(resource)?;
        Ok(())
    }

    async fn rrd_data(&self, resource: ResourceRef, _timeframe: &str) -> Result<Vec<RrdPoint>> {
        self.lookup(resource)?;
        Ok(vec![
            RrdPoint {
                time: 1_700_000_000,
                cpu: Some(0.10),
                mem: Some(512.0 * 1024.0 * 1024.0),
                maxmem: Some(2048.0 * 1024.0 * 1024.0),
                netin: Some(100.0),
                netout: Some(50.0),
            },
            RrdPoint {
                time: 1_700_000_060,
                cpu: Some(0.30),
                mem: Some(1024.0 * 1024.0 * 1024.0),
                maxmem: Some(2048.0 * 1024.0 * 1024.0),
                netin: None,
                netout: None,
            },
        ])
    }
}
