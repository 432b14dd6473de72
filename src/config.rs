// Service configuration
//
// One JSON document holds the Proxmox credentials and every tunable.
// Credentials may instead come from the environment so the file can be
// committed without secrets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::monitor::MonitorSettings;
use crate::orchestrator::OrchestratorSettings;
use crate::proxmox::ClientOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    // Proxmox settings
    pub proxmox_url: String,
    pub proxmox_token_id: String,
    pub proxmox_token_secret: String,
    pub proxmox_node: String,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
    /// Extra attempts after a transport failure
    pub remote_retries: u32,
    pub task_timeout_secs: u64,

    // Watch-list
    pub watchlist_path: String,
    /// Only used when the watch-list file does not exist yet
    pub initial_watchlist: Vec<u32>,

    // Monitoring
    pub monitor_interval_secs: u64,
    pub monitor_query_timeout_secs: u64,

    // Confirmations
    pub confirmation_ttl_secs: u64,
    pub confirmation_cleanup_interval_secs: u64,

    // Lifecycle limits
    pub delete_stop_poll_attempts: u32,
    pub delete_stop_poll_interval_secs: u64,
    pub max_cores: u32,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            proxmox_url: "https://localhost:8006/api2/json".to_string(),
            proxmox_token_id: "root@pam!proxguard".to_string(),
            proxmox_token_secret: String::new(),
            proxmox_node: "pve".to_string(),
            verify_tls: false,
            request_timeout_secs: 30,
            remote_retries: 1,
            task_timeout_secs: 120,
            watchlist_path: "monitor_list.json".to_string(),
            initial_watchlist: Vec::new(),
            monitor_interval_secs: 60,
            monitor_query_timeout_secs: 15,
            confirmation_ttl_secs: 180,
            confirmation_cleanup_interval_secs: 60,
            delete_stop_poll_attempts: 15,
            delete_stop_poll_interval_secs: 2,
            max_cores: 128,
            min_memory_mb: 16,
            max_memory_mb: 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    /// Let PROXMOX_* variables override the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields = [
            ("PROXMOX_URL", &mut self.proxmox_url),
            ("PROXMOX_TOKEN_ID", &mut self.proxmox_token_id),
            ("PROXMOX_TOKEN_SECRET", &mut self.proxmox_token_secret),
            ("PROXMOX_NODE", &mut self.proxmox_node),
        ];
        for (key, field) in fields {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *field = value;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.proxmox_url.is_empty() || self.proxmox_node.is_empty() {
            anyhow::bail!("proxmox_url and proxmox_node must be set");
        }
        if self.proxmox_token_id.is_empty() || self.proxmox_token_secret.is_empty() {
            anyhow::bail!("Proxmox API token is missing (set PROXMOX_TOKEN_ID and PROXMOX_TOKEN_SECRET)");
        }
        if self.monitor_interval_secs == 0 {
            anyhow::bail!("monitor_interval_secs must be greater than zero");
        }
        if self.min_memory_mb > self.max_memory_mb {
            anyhow::bail!("min_memory_mb exceeds max_memory_mb");
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retries: self.remote_retries,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            verify_tls: self.verify_tls,
            ..ClientOptions::default()
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.monitor_interval_secs),
            query_timeout: Duration::from_secs(self.monitor_query_timeout_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_cores: self.max_cores,
            min_memory_mb: self.min_memory_mb,
            max_memory_mb: self.max_memory_mb,
            delete_stop_poll_attempts: self.delete_stop_poll_attempts,
            delete_stop_poll_interval: Duration::from_secs(self.delete_stop_poll_interval_secs),
            confirmation_ttl: Duration::from_secs(self.confirmation_ttl_secs),
        }
    }

    pub fn confirmation_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation_cleanup_interval_secs.max(1))
    }
}

/// Load service config from file
pub fn load_config(path: &str) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read config file: {}", path))?;

    serde_json::from_str(&content)
        .context("Failed to parse service config")
}

/// Save service config to file
pub fn save_config(path: &str, config: &ServiceConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)
        .context(format!("Failed to write config file: {}", path))?;
    Ok(())
}
