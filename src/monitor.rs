// Monitoring Scheduler
//
// Periodically sweeps the watch-list, compares each resource's status with
// the previous sweep and raises an alert on every transition into a down
// state. At most one sweep runs at a time; ticks that land while a sweep is
// still running are skipped.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::{AlertRecord, AlertSink, MonitorEvent};
use crate::compute::ResourceBackend;
use crate::models::{ResourceKind, ResourceRef, ResourceStatus, ResourceSummary};
use crate::watchlist::WatchListStore;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Upper bound for each remote query inside a sweep
    pub query_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            query_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Default)]
struct SweepState {
    last_status: HashMap<u32, ResourceStatus>,
    /// Reported as gone; skipped until the node lists them again
    missing: HashSet<u32>,
    /// Last resolved kind per VMID, used when the listing itself fails
    known: HashMap<u32, ResourceRef>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub statuses: Vec<(u32, ResourceStatus)>,
    pub events: Vec<MonitorEvent>,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Completed(SweepReport),
    /// Previous sweep still in flight
    Skipped,
}

pub struct MonitoringScheduler {
    backend: Arc<dyn ResourceBackend>,
    watchlist: Arc<WatchListStore>,
    sink: Arc<dyn AlertSink>,
    settings: MonitorSettings,
    state: Mutex<SweepState>,
    in_flight: Mutex<()>,
}

impl MonitoringScheduler {
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        watchlist: Arc<WatchListStore>,
        sink: Arc<dyn AlertSink>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            backend,
            watchlist,
            sink,
            settings,
            state: Mutex::new(SweepState::default()),
            in_flight: Mutex::new(()),
        }
    }

    /// Drive sweeps on the fixed interval forever. Each sweep runs on its own
    /// task so a slow one cannot delay the schedule.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Monitoring {} resources every {}s",
            self.watchlist.list().len(),
            self.settings.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let this = self.clone();
            tokio::spawn(async move {
                this.tick().await;
            });
        }
    }

    /// Run one sweep unless another is still in progress.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Previous sweep still running, skipping this tick");
            return TickOutcome::Skipped;
        };
        TickOutcome::Completed(self.sweep().await)
    }

    async fn sweep(&self) -> SweepReport {
        let watched = self.watchlist.list();
        let listing = self.fetch_listing().await;

        let mut report = SweepReport::default();
        let mut targets: Vec<(ResourceRef, String)> = Vec::new();
        let mut unreachable: Vec<(ResourceRef, String)> = Vec::new();

        {
            let mut state = self.state.lock().await;
            state.last_status.retain(|vmid, _| watched.contains(vmid));
            state.missing.retain(|vmid| watched.contains(vmid));
            state.known.retain(|vmid, _| watched.contains(vmid));

            for &vmid in &watched {
                match &listing {
                    None => {
                        let resource = state
                            .known
                            .get(&vmid)
                            .copied()
                            .unwrap_or_else(|| ResourceRef::new(vmid, ResourceKind::Vm));
                        unreachable.push((resource, String::new()));
                    }
                    Some(listing) => match listing.get(&vmid) {
                        Some(summary) => {
                            if state.missing.remove(&vmid) {
                                info!("VMID {} is back on the node", vmid);
                            }
                            state.known.insert(vmid, summary.resource);
                            targets.push((summary.resource, summary.name.clone()));
                        }
                        None => {
                            state.last_status.remove(&vmid);
                            if state.missing.insert(vmid) {
                                report.events.push(MonitorEvent::ResourceMissing {
                                    vmid,
                                    detected_at: Utc::now(),
                                });
                            }
                        }
                    },
                }
            }
        }

        // Queries run concurrently; one slow guest must not hold up the rest
        let query_timeout = self.settings.query_timeout;
        let observations = futures::future::join_all(targets.into_iter().map(
            |(resource, listed_name)| async move {
                match timeout(query_timeout, self.backend.get(resource)).await {
                    Ok(Ok(state)) => (resource, state.name, state.status),
                    Ok(Err(e)) => {
                        warn!("Status query for {} failed: {}", resource, e);
                        (resource, listed_name, ResourceStatus::Unknown)
                    }
                    Err(_) => {
                        warn!("Status query for {} timed out", resource);
                        (resource, listed_name, ResourceStatus::Unknown)
                    }
                }
            },
        ))
        .await;

        let observed = observations.into_iter().chain(
            unreachable
                .into_iter()
                .map(|(resource, name)| (resource, name, ResourceStatus::Unknown)),
        );

        {
            let mut state = self.state.lock().await;
            for (resource, name, current) in observed {
                let previous = state.last_status.insert(resource.vmid, current);
                let was_down = previous.map(|s| s.is_down()).unwrap_or(false);

                if current.is_down() && !was_down {
                    report.events.push(MonitorEvent::StateChanged(AlertRecord {
                        resource,
                        name,
                        previous_status: previous,
                        current_status: current,
                        detected_at: Utc::now(),
                    }));
                } else if was_down && !current.is_down() {
                    info!("{} recovered ({})", resource, current);
                }

                report.checked += 1;
                report.statuses.push((resource.vmid, current));
            }
        }

        for event in &report.events {
            self.sink.deliver(event.clone()).await;
        }

        debug!(
            "Sweep checked {} resources, raised {} events",
            report.checked,
            report.events.len()
        );
        report
    }

    async fn fetch_listing(&self) -> Option<HashMap<u32, ResourceSummary>> {
        match timeout(self.settings.query_timeout, self.backend.list()).await {
            Ok(Ok(items)) => Some(
                items
                    .into_iter()
                    .map(|summary| (summary.resource.vmid, summary))
                    .collect(),
            ),
            Ok(Err(e)) => {
                warn!("Resource listing failed, treating watched resources as unknown: {}", e);
                None
            }
            Err(_) => {
                warn!("Resource listing timed out, treating watched resources as unknown");
                None
            }
        }
    }
}
