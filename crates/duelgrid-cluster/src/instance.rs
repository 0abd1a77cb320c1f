//! Instance registry: who is in the cluster and who is still alive.
//!
//! Each instance writes its own registry entry under a TTL and
//! refreshes it on a heartbeat interval. An entry that stops being
//! refreshed expires, which is the cluster's crash signal: the room
//! layer watches for rooms whose owner key has vanished.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use duelgrid_protocol::InstanceId;
use duelgrid_store::{keys, CoordStore};

use crate::ClusterError;

/// Milliseconds since the Unix epoch. Wall-clock timestamps are only
/// used for display and staleness heuristics, never for ordering.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
}

/// One instance's registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub last_heartbeat: u64,
    pub rpc_address: String,
}

/// Heartbeat cadence and registration TTL.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_interval: Duration,
    /// TTL on the registry key. Must comfortably exceed the heartbeat
    /// interval so one missed beat does not look like a crash.
    pub registration_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            registration_ttl: Duration::from_secs(15),
        }
    }
}

/// Registers the local instance and reads the rest of the fleet.
pub struct InstanceRegistry<S> {
    store: Arc<S>,
    self_id: InstanceId,
    rpc_address: String,
    config: RegistryConfig,
}

impl<S> Clone for InstanceRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            self_id: self.self_id.clone(),
            rpc_address: self.rpc_address.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: CoordStore> InstanceRegistry<S> {
    pub fn new(
        store: Arc<S>,
        self_id: InstanceId,
        rpc_address: impl Into<String>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            self_id,
            rpc_address: rpc_address.into(),
            config,
        }
    }

    pub fn self_id(&self) -> &InstanceId {
        &self.self_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Writes (or refreshes) the local instance's registry entry.
    pub async fn register(&self) -> Result<(), ClusterError> {
        let entry = ServiceInstance {
            id: self.self_id.clone(),
            status: InstanceStatus::Healthy,
            last_heartbeat: epoch_ms(),
            rpc_address: self.rpc_address.clone(),
        };
        self.store
            .set(
                &keys::instance(&self.self_id),
                &serde_json::to_string(&entry)?,
                Some(self.config.registration_ttl),
            )
            .await?;
        Ok(())
    }

    /// Removes the local instance's entry, for graceful shutdown.
    pub async fn deregister(&self) -> Result<(), ClusterError> {
        self.store.del(&keys::instance(&self.self_id)).await?;
        tracing::info!(instance_id = %self.self_id, "instance deregistered");
        Ok(())
    }

    /// Spawns the heartbeat loop. The task re-registers on every tick
    /// until aborted; abort it during shutdown after deregistering.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = registry.register().await {
                    tracing::warn!(%error, "heartbeat registration failed");
                }
            }
        })
    }

    /// Reads one instance's entry. `None` if unregistered or expired.
    pub async fn get(&self, id: &InstanceId) -> Result<Option<ServiceInstance>, ClusterError> {
        match self.store.get(&keys::instance(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether an instance currently holds a live registration.
    pub async fn is_registered(&self, id: &InstanceId) -> Result<bool, ClusterError> {
        Ok(self.store.get(&keys::instance(id)).await?.is_some())
    }

    /// Lists every live instance, sorted by id. Entries that fail to
    /// parse are logged and skipped.
    pub async fn instances(&self) -> Result<Vec<ServiceInstance>, ClusterError> {
        let mut out = Vec::new();
        for key in self.store.scan(keys::INSTANCE_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<ServiceInstance>(&raw) {
                Ok(entry) => out.push(entry),
                Err(error) => {
                    tracing::warn!(%key, %error, "skipping malformed instance entry");
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
