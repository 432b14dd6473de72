// Proxguard Library
//
// Lifecycle orchestration and downtime monitoring for the VMs and
// containers of a single Proxmox node.

// Module declarations
pub mod alerts;
pub mod compute;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod proxmox;
pub mod service;
pub mod watchlist;

#[cfg(test)]
mod testing;

// Re-export public types and functions
pub use alerts::{AlertRecord, AlertSink, ChannelAlertSink, MonitorEvent, TracingAlertSink};
pub use compute::ResourceBackend;
pub use config::{load_config, save_config, ServiceConfig};
pub use error::{ErrorKind, OrchestratorError};
pub use models::{CommandIntent, CommandOutcome, CommandResult, IntentEnvelope};
pub use monitor::{MonitorSettings, MonitoringScheduler, TickOutcome};
pub use orchestrator::{LifecycleOrchestrator, OrchestratorSettings};
pub use proxmox::{ClientOptions, ProxmoxClient};
pub use watchlist::WatchListStore;
