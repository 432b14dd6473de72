// Resource Backend Trait
//
// Abstracts the virtualization API the orchestrator and monitor talk to.
// The Proxmox implementation lives in `proxmox.rs`; tests use an in-memory fake.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{PowerAction, ResourceRef, ResourceState, ResourceSummary, RrdPoint, Snapshot};

#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// All VMs and containers on the managed node
    async fn list(&self) -> Result<Vec<ResourceSummary>>;

    /// Current status of one resource
    async fn get(&self, resource: ResourceRef) -> Result<ResourceState>;

    /// Full clone of `template` into `new_vmid`. Returns the task id.
    async fn create(&self, template: ResourceRef, new_vmid: u32, name: &str) -> Result<String>;

    /// Stage a CPU/memory change. Takes effect on the next restart.
    async fn resize(&self, resource: ResourceRef, cores: u32, memory_mb: u64) -> Result<()>;

    /// Power transition. `Start` on a running guest succeeds without effect.
    async fn power(&self, resource: ResourceRef, action: PowerAction) -> Result<()>;

    async fn delete(&self, resource: ResourceRef) -> Result<()>;

    async fn snapshot_create(&self, resource: ResourceRef, name: &str) -> Result<()>;

    async fn snapshot_list(&self, resource: ResourceRef) -> Result<Vec<Snapshot>>;

    async fn snapshot_rollback(&self, resource: ResourceRef, name: &str) -> Result<()>;

    /// Time-series samples for `timeframe` (hour, day, week, month, year)
    async fn rrd_data(&self, resource: ResourceRef, timeframe: &str) -> Result<Vec<RrdPoint>>;

    /// Resolve a bare VMID to its kind through the node listing.
    async fn locate(&self, vmid: u32) -> Result<Option<ResourceRef>> {
        let resources = self.list().await?;
        Ok(resources
            .into_iter()
            .find(|r| r.resource.vmid == vmid)
            .map(|r| r.resource))
    }
}
