// Confirmation Workflow Manager
//
// Destructive commands park here as pending records keyed by (vmid, action)
// until the operator confirms them with the issued token. Expiry is checked
// lazily when a token is presented.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::models::{ConfirmableAction, ResourceRef};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingConfirmation {
    pub token: String,
    pub resource: ResourceRef,
    pub action: ConfirmableAction,
    /// Target snapshot for rollbacks
    pub snapshot: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub requested_by: String,
}

impl PendingConfirmation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What the confirming operator claims to be confirming. Fields left `None`
/// are not checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmationMatch {
    pub vmid: Option<u32>,
    pub action: Option<ConfirmableAction>,
}

type Key = (u32, ConfirmableAction);

pub struct ConfirmationManager {
    ttl: Duration,
    pending: Mutex<HashMap<Key, PendingConfirmation>>,
}

impl ConfirmationManager {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(180)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn request(
        &self,
        resource: ResourceRef,
        action: ConfirmableAction,
        snapshot: Option<String>,
        requested_by: &str,
    ) -> PendingConfirmation {
        self.request_at(resource, action, snapshot, requested_by, Utc::now())
            .await
    }

    /// Register or refresh the record for `(resource, action)`. A refresh keeps
    /// the original token so an already displayed prompt stays valid. A request
    /// naming a different snapshot replaces the record under a new token, so a
    /// prompt never confirms a target its reader was not shown.
    pub async fn request_at(
        &self,
        resource: ResourceRef,
        action: ConfirmableAction,
        snapshot: Option<String>,
        requested_by: &str,
        now: DateTime<Utc>,
    ) -> PendingConfirmation {
        let mut pending = self.pending.lock().await;
        let key = (resource.vmid, action);

        let token = match pending.get(&key) {
            Some(existing) if existing.snapshot == snapshot => {
                debug!("Refreshing pending {} for {}", action, resource);
                existing.token.clone()
            }
            Some(existing) => {
                info!(
                    "Pending {} for {} retargeted from {:?} to {:?}, old token revoked",
                    action, resource, existing.snapshot, snapshot
                );
                uuid::Uuid::new_v4().to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let record = PendingConfirmation {
            token,
            resource,
            action,
            snapshot,
            requested_at: now,
            expires_at: now + self.ttl,
            requested_by: requested_by.to_string(),
        };
        pending.insert(key, record.clone());

        info!(
            "Awaiting confirmation of {} for {} (token {}, expires {})",
            action, resource, record.token, record.expires_at
        );
        record
    }

    pub async fn confirm(&self, token: &str, expected: ConfirmationMatch) -> Result<PendingConfirmation> {
        self.confirm_at(token, expected, Utc::now()).await
    }

    /// Consume the record behind `token`. Expired records are discarded;
    /// mismatched ones are left in place for the right confirmation.
    pub async fn confirm_at(
        &self,
        token: &str,
        expected: ConfirmationMatch,
        now: DateTime<Utc>,
    ) -> Result<PendingConfirmation> {
        let mut pending = self.pending.lock().await;

        let key = find_key(&pending, token).ok_or_else(|| {
            OrchestratorError::NotFound(format!("no pending confirmation for token {}", token))
        })?;
        let record = &pending[&key];

        if record.is_expired(now) {
            let resource = record.resource;
            let action = record.action;
            pending.remove(&key);
            info!("Confirmation of {} for {} expired", action, resource);
            return Err(OrchestratorError::ConfirmationExpired { resource, action });
        }

        if let Some(vmid) = expected.vmid {
            if vmid != record.resource.vmid {
                return Err(OrchestratorError::ConfirmationMismatch(format!(
                    "token belongs to VMID {}, not {}",
                    record.resource.vmid, vmid
                )));
            }
        }
        if let Some(action) = expected.action {
            if action != record.action {
                return Err(OrchestratorError::ConfirmationMismatch(format!(
                    "token confirms {}, not {}",
                    record.action, action
                )));
            }
        }

        pending
            .remove(&key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pending confirmation for token {}", token)))
    }

    pub async fn cancel(&self, token: &str) -> Result<PendingConfirmation> {
        let mut pending = self.pending.lock().await;
        let key = find_key(&pending, token).ok_or_else(|| {
            OrchestratorError::NotFound(format!("no pending confirmation for token {}", token))
        })?;
        pending
            .remove(&key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("no pending confirmation for token {}", token)))
    }

    /// Drop every record past its expiry. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, record| !record.is_expired(now));
        before - pending.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn find_key(pending: &HashMap<Key, PendingConfirmation>, token: &str) -> Option<Key> {
    pending
        .iter()
        .find(|(_, record)| record.token == token)
        .map(|(key, _)| *key)
}
