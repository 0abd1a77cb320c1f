//! Leader election for the matchmaking role.
//!
//! The leader is not elected by consensus. Every instance derives the
//! same answer from shared state: sort the healthy instances by id and
//! take the first one that is verifiably reachable. The derivation runs
//! under a dedicated lock so no two instances compute it against a
//! half-mutated registry.
//!
//! When nothing at all is reachable the caller assumes leadership.
//! That biases toward availability: during a partition two instances
//! may briefly both sweep, which the matchmaking layer absorbs by
//! re-verifying entries under a pair lock before acting on them.

use std::time::Duration;

use crate::instance::epoch_ms;
use crate::{ClusterError, InstanceRegistry, ServiceInstance};
use duelgrid_store::{keys, CoordStore, LockError, LockManager, LockOptions};

/// Decides whether a fleet member can currently be trusted to act.
pub trait ReachabilityProber: Send + Sync {
    fn probe(&self, instance: &ServiceInstance) -> impl Future<Output = bool> + Send;
}

/// Default prober: an instance is reachable if its last heartbeat is
/// recent enough. No network round trip, just registry freshness.
#[derive(Debug, Clone)]
pub struct HeartbeatProber {
    max_staleness: Duration,
}

impl HeartbeatProber {
    /// Allows up to 1.5 heartbeat intervals of silence before an
    /// instance is considered unreachable.
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            max_staleness: heartbeat_interval + heartbeat_interval / 2,
        }
    }
}

impl ReachabilityProber for HeartbeatProber {
    async fn probe(&self, instance: &ServiceInstance) -> bool {
        let age_ms = epoch_ms().saturating_sub(instance.last_heartbeat);
        age_ms <= self.max_staleness.as_millis() as u64
    }
}

/// Computes whether the local instance is the current leader.
pub struct LeaderElector<S, P> {
    registry: InstanceRegistry<S>,
    locks: LockManager<S>,
    prober: P,
    lock_options: LockOptions,
}

impl<S: CoordStore, P: ReachabilityProber> LeaderElector<S, P> {
    pub fn new(registry: InstanceRegistry<S>, locks: LockManager<S>, prober: P) -> Self {
        Self {
            registry,
            locks,
            prober,
            // Elections are quick; fail fast rather than queueing up.
            lock_options: LockOptions {
                ttl: Duration::from_secs(10),
                retry_count: 3,
                retry_delay: Duration::from_millis(100),
            },
        }
    }

    /// Runs an election and reports whether the local instance won.
    ///
    /// Losing the election lock means another instance is electing
    /// right now; we answer `false` and let it lead this round.
    pub async fn is_leader(&self) -> Result<bool, ClusterError> {
        let result = self
            .locks
            .with_lock_opts(
                keys::LOCK_LEADER_ELECTION,
                &self.lock_options,
                || self.elect(),
            )
            .await;
        match result {
            Ok(inner) => inner,
            Err(LockError::Timeout { .. }) => {
                tracing::debug!("election lock contended, deferring this round");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn elect(&self) -> Result<bool, ClusterError> {
        let self_id = self.registry.self_id().clone();
        let fleet = self.registry.instances().await?;

        for candidate in fleet
            .iter()
            .filter(|i| i.status == crate::InstanceStatus::Healthy)
        {
            // The local instance vouches for itself.
            if candidate.id == self_id {
                return Ok(true);
            }
            if self.prober.probe(candidate).await {
                tracing::trace!(leader_id = %candidate.id, "another instance leads");
                return Ok(false);
            }
        }

        // Nothing reachable, not even our own registration. Assume
        // leadership so matchmaking keeps running.
        tracing::warn!(
            instance_id = %self_id,
            "no reachable instance found, assuming leadership"
        );
        Ok(true)
    }
}
