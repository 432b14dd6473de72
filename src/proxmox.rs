// Proxmox VE API Client
//
// Talks to the Proxmox REST API for one node and normalizes its responses
// and failures into the crate error taxonomy.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::compute::ResourceBackend;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    PowerAction, ResourceKind, ResourceRef, ResourceState, ResourceStatus, ResourceSummary,
    RrdPoint, Snapshot,
};

/// Transport knobs for [`ProxmoxClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    /// Extra attempts after a `RemoteUnavailable` failure
    pub retries: u32,
    pub retry_delay: Duration,
    /// How long to wait for delete/snapshot tasks to finish
    pub task_timeout: Duration,
    pub verify_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retries: 1,
            retry_delay: Duration::from_secs(1),
            task_timeout: Duration::from_secs(120),
            verify_tls: false,
        }
    }
}

/// Whether a request may be sent again after a transport failure. Creating
/// and destroying calls may already have been applied when the response is
/// lost, so they are never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    Never,
}

/// Proxmox API client scoped to a single node
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    auth_header: String,
    node: String,
    options: ClientOptions,
}

/// Proxmox API response wrapper
#[derive(Debug, Deserialize)]
struct ProxmoxResponse {
    #[serde(default)]
    data: serde_json::Value,
}

/// Error body Proxmox sends alongside non-2xx statuses
#[derive(Debug, Deserialize)]
struct ProxmoxErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

/// Entry of `/cluster/resources?type=vm`
#[derive(Debug, Clone, Deserialize)]
struct ClusterResource {
    vmid: u32,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    maxcpu: Option<f64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    uptime: Option<u64>,
}

/// `/nodes/{node}/{qemu|lxc}/{vmid}/status/current`
#[derive(Debug, Clone, Deserialize)]
struct StatusCurrent {
    status: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    qmpstatus: Option<String>,
    #[serde(default)]
    cpus: Option<f64>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    uptime: Option<u64>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotEntry {
    name: String,
    #[serde(default)]
    snaptime: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ResizeForm {
    cores: u32,
    memory: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CloneForm {
    newid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    full: u8,
}

impl CloneForm {
    fn for_kind(kind: ResourceKind, newid: u32, name: &str) -> Self {
        // LXC clones take `hostname`, QEMU clones take `name`
        let (vm_name, hostname) = match kind {
            ResourceKind::Vm => (Some(name.to_string()), None),
            ResourceKind::Container => (None, Some(name.to_string())),
        };
        Self {
            newid,
            name: vm_name,
            hostname,
            full: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SnapshotForm {
    snapname: String,
}

impl ProxmoxClient {
    /// Create a new Proxmox client
    ///
    /// # Arguments
    /// * `api_url` - Base URL of the Proxmox API (e.g., "https://192.168.1.100:8006/api2/json")
    /// * `token_id` - API token ID (e.g., "root@pam!proxguard")
    /// * `token_secret` - API token secret
    /// * `node` - Proxmox node name (e.g., "pve")
    pub fn new(
        api_url: &str,
        token_id: &str,
        token_secret: &str,
        node: &str,
        options: ClientOptions,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = Client::builder()
            .danger_accept_invalid_certs(!options.verify_tls)
            .timeout(options.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let auth_header = format!("PVEAPIToken={}={}", token_id, token_secret);

        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
            auth_header,
            node: node.to_string(),
            options,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Get the node URL prefix
    fn node_url(&self) -> String {
        format!("{}/nodes/{}", self.base_url, self.node)
    }

    fn resource_url(&self, resource: ResourceRef) -> String {
        format!(
            "{}/{}/{}",
            self.node_url(),
            resource.kind.api_path(),
            resource.vmid
        )
    }

    /// Issue a request. Replay-safe requests retry transport failures up to
    /// the configured count.
    async fn call<F>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        form: Option<&F>,
        replay: Replay,
    ) -> Result<serde_json::Value>
    where
        F: Serialize + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match self.call_once(method.clone(), url, query, form).await {
                Err(OrchestratorError::RemoteUnavailable(msg)) if replay == Replay::Never => {
                    return Err(OrchestratorError::RemoteUnavailable(format!(
                        "{} (not retried, the request may have been applied)",
                        msg
                    )));
                }
                Err(e) if e.is_retryable() && attempt < self.options.retries => {
                    attempt += 1;
                    warn!("{} {} failed ({}), retrying ({}/{})", method, url, e, attempt, self.options.retries);
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn call_once<F>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        form: Option<&F>,
    ) -> Result<serde_json::Value>
    where
        F: Serialize + ?Sized,
    {
        let mut request = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, &self.auth_header);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        let response = request.send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let body = response.text().await.unwrap_or_default();
            debug!("Proxmox error {} - {}", status, body);
            return Err(classify_failure(status, &reason, &body));
        }

        let body: ProxmoxResponse = response.json().await.map_err(|e| {
            OrchestratorError::RemoteRejected(format!("unexpected response from Proxmox: {}", e))
        })?;
        Ok(body.data)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let data = self.call::<()>(Method::GET, url, query, None, Replay::Safe).await?;
        decode(data)
    }

    /// Wait for a task to complete
    pub async fn wait_for_task(&self, upid: &str, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        let url = format!("{}/tasks/{}/status", self.node_url(), upid);

        loop {
            if start.elapsed() > timeout {
                return Err(OrchestratorError::RemoteUnavailable(format!(
                    "task {} did not finish within {}s",
                    upid,
                    timeout.as_secs()
                )));
            }

            let task: TaskStatus = self.get_json(&url, &[]).await?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    None | Some("OK") => Ok(()),
                    Some(exit) => Err(OrchestratorError::RemoteRejected(format!(
                        "task failed with: {}",
                        exit
                    ))),
                };
            }

            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn post_task<F: Serialize + ?Sized>(
        &self,
        url: &str,
        form: Option<&F>,
        replay: Replay,
    ) -> Result<String> {
        let data = self.call(Method::POST, url, &[], form, replay).await?;
        Ok(upid_of(data))
    }
}

#[async_trait]
impl ResourceBackend for ProxmoxClient {
    async fn list(&self) -> Result<Vec<ResourceSummary>> {
        let url = format!("{}/cluster/resources", self.base_url);
        let items: Vec<ClusterResource> = self.get_json(&url, &[("type", "vm")]).await?;
        Ok(summaries_for_node(items, &self.node))
    }

    async fn get(&self, resource: ResourceRef) -> Result<ResourceState> {
        let url = format!("{}/status/current", self.resource_url(resource));
        let current: StatusCurrent = self.get_json(&url, &[]).await?;
        Ok(state_from_current(resource, current))
    }

    async fn create(&self, template: ResourceRef, new_vmid: u32, name: &str) -> Result<String> {
        let url = format!("{}/clone", self.resource_url(template));
        info!("Cloning {} into {} ({}) on node {}", template, new_vmid, name, self.node);

        let form = CloneForm::for_kind(template.kind, new_vmid, name);
        let upid = self.post_task(&url, Some(&form), Replay::Never).await?;
        info!("Clone task started: {}", upid);
        Ok(upid)
    }

    async fn resize(&self, resource: ResourceRef, cores: u32, memory_mb: u64) -> Result<()> {
        let url = format!("{}/config", self.resource_url(resource));
        info!("Staging {} cores / {} MB for {}", cores, memory_mb, resource);

        let form = ResizeForm { cores, memory: memory_mb };
        self.call(Method::PUT, &url, &[], Some(&form), Replay::Safe).await?;
        Ok(())
    }

    async fn power(&self, resource: ResourceRef, action: PowerAction) -> Result<()> {
        let url = format!("{}/status/{}", self.resource_url(resource), action.endpoint());
        info!("Sending {} to {}", action, resource);

        match self.post_task::<()>(&url, None, Replay::Safe).await {
            Ok(upid) => {
                debug!("Power task for {}: {}", resource, upid);
                Ok(())
            }
            Err(OrchestratorError::RemoteRejected(msg))
                if action == PowerAction::Start && msg.contains("already running") =>
            {
                info!("{} already running", resource);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, resource: ResourceRef) -> Result<()> {
        let url = self.resource_url(resource);
        info!("Deleting {}", resource);

        let data = self.call::<()>(Method::DELETE, &url, &[], None, Replay::Never).await?;
        self.wait_for_task(&upid_of(data), self.options.task_timeout).await
    }

    async fn snapshot_create(&self, resource: ResourceRef, name: &str) -> Result<()> {
        let url = format!("{}/snapshot", self.resource_url(resource));
        info!("Creating snapshot '{}' of {}", name, resource);

        let form = SnapshotForm { snapname: name.to_string() };
        let upid = self.post_task(&url, Some(&form), Replay::Never).await?;
        self.wait_for_task(&upid, self.options.task_timeout).await
    }

    async fn snapshot_list(&self, resource: ResourceRef) -> Result<Vec<Snapshot>> {
        let url = format!("{}/snapshot", self.resource_url(resource));
        let entries: Vec<SnapshotEntry> = self.get_json(&url, &[]).await?;
        Ok(snapshots_from_entries(resource, entries))
    }

    async fn snapshot_rollback(&self, resource: ResourceRef, name: &str) -> Result<()> {
        let url = format!("{}/snapshot/{}/rollback", self.resource_url(resource), name);
        info!("Rolling back {} to snapshot '{}'", resource, name);

        let upid = self.post_task::<()>(&url, None, Replay::Never).await?;
        self.wait_for_task(&upid, self.options.task_timeout).await
    }

    async fn rrd_data(&self, resource: ResourceRef, timeframe: &str) -> Result<Vec<RrdPoint>> {
        let url = format!("{}/rrddata", self.resource_url(resource));
        self.get_json(&url, &[("timeframe", timeframe), ("cf", "AVERAGE")])
            .await
    }
}

fn decode<T: DeserializeOwned>(data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| {
        OrchestratorError::RemoteRejected(format!("unexpected response from Proxmox: {}", e))
    })
}

fn upid_of(data: serde_json::Value) -> String {
    match data {
        serde_json::Value::String(upid) => upid,
        other => other.to_string(),
    }
}

fn transport_error(err: reqwest::Error) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::RemoteUnavailable(format!("request timed out: {}", err))
    } else {
        OrchestratorError::RemoteUnavailable(err.to_string())
    }
}

/// Map a non-2xx Proxmox response onto the error taxonomy.
fn classify_failure(status: StatusCode, reason: &str, body: &str) -> OrchestratorError {
    let message = match serde_json::from_str::<ProxmoxErrorBody>(body) {
        Ok(parsed) => match (parsed.message, parsed.errors) {
            (Some(msg), Some(errors)) => format!("{} {}", msg.trim(), errors),
            (Some(msg), None) => msg.trim().to_string(),
            (None, Some(errors)) => errors.to_string(),
            (None, None) => reason.to_string(),
        },
        Err(_) if body.trim().is_empty() => reason.to_string(),
        Err(_) => body.trim().to_string(),
    };

    let lowered = message.to_lowercase();
    if status == StatusCode::NOT_FOUND
        || lowered.contains("does not exist")
        || lowered.contains("no such")
    {
        return OrchestratorError::NotFound(message);
    }

    match status.as_u16() {
        // 596 is Proxmox's proxy timeout between cluster nodes
        408 | 502 | 503 | 504 | 596 => {
            OrchestratorError::RemoteUnavailable(format!("{} - {}", status.as_u16(), message))
        }
        _ => OrchestratorError::RemoteRejected(format!("{} - {}", status.as_u16(), message)),
    }
}

fn summaries_for_node(items: Vec<ClusterResource>, node: &str) -> Vec<ResourceSummary> {
    let mut summaries: Vec<ResourceSummary> = items
        .into_iter()
        .filter(|item| item.node == node)
        .filter_map(|item| {
            let kind = ResourceKind::from_api_type(&item.resource_type)?;
            Some(ResourceSummary {
                resource: ResourceRef::new(item.vmid, kind),
                name: item.name.unwrap_or_default(),
                status: ResourceStatus::from_api(&item.status, None),
                node: item.node,
                max_cpu: item.maxcpu.unwrap_or(0.0).round() as u32,
                max_memory_mb: item.maxmem.unwrap_or(0) / (1024 * 1024),
                uptime_seconds: item.uptime.unwrap_or(0),
            })
        })
        .collect();
    summaries.sort_by_key(|s| s.resource.vmid);
    summaries
}

fn state_from_current(resource: ResourceRef, current: StatusCurrent) -> ResourceState {
    ResourceState {
        resource,
        name: current.name.unwrap_or_default(),
        status: ResourceStatus::from_api(&current.status, current.qmpstatus.as_deref()),
        cpu_cores: current.cpus.unwrap_or(0.0).round() as u32,
        memory_mb: current.maxmem.unwrap_or(0) / (1024 * 1024),
        uptime_seconds: current.uptime.unwrap_or(0),
        cpu_usage: current.cpu,
        memory_used_mb: current.mem.map(|bytes| bytes / (1024 * 1024)),
    }
}

fn snapshots_from_entries(resource: ResourceRef, entries: Vec<SnapshotEntry>) -> Vec<Snapshot> {
    entries
        .into_iter()
        // "current" is the live state, not a snapshot
        .filter(|entry| entry.name != "current")
        .map(|entry| Snapshot {
            resource,
            name: entry.name,
            created_at: entry.snaptime.and_then(|t| DateTime::from_timestamp(t, 0)),
            description: entry.description.unwrap_or_default().trim().to_string(),
        })
        .collect()
}
