//! Owner selection: which instance hosts a new room's simulation.

use duelgrid_protocol::InstanceId;

use duelgrid_cluster::ServiceInstance;

/// Picks the owning instance for a new room out of the live fleet.
pub trait OwnerSelector: Send + Sync + 'static {
    fn select(&self, fleet: &[ServiceInstance], self_id: &InstanceId) -> InstanceId;
}

/// Default placement: the creating instance keeps the room. Cheapest
/// option since the match was swept here and no delegation RPC is
/// needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOwner;

impl OwnerSelector for LocalOwner {
    fn select(&self, _fleet: &[ServiceInstance], self_id: &InstanceId) -> InstanceId {
        self_id.clone()
    }
}

/// Spreads rooms by picking the instance hosting the fewest rooms, as
/// reported through the load counts passed in at construction time.
/// Falls back to local when the fleet view is empty.
pub struct LeastLoadedOwner<F> {
    load_of: F,
}

impl<F> LeastLoadedOwner<F>
where
    F: Fn(&InstanceId) -> usize + Send + Sync + 'static,
{
    pub fn new(load_of: F) -> Self {
        Self { load_of }
    }
}

impl<F> OwnerSelector for LeastLoadedOwner<F>
where
    F: Fn(&InstanceId) -> usize + Send + Sync + 'static,
{
    fn select(&self, fleet: &[ServiceInstance], self_id: &InstanceId) -> InstanceId {
        fleet
            .iter()
            .min_by_key(|i| (self.load_of)(&i.id))
            .map(|i| i.id.clone())
            .unwrap_or_else(|| self_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duelgrid_cluster::{epoch_ms, InstanceStatus};

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            id: InstanceId::from(id),
            status: InstanceStatus::Healthy,
            last_heartbeat: epoch_ms(),
            rpc_address: format!("{id}:9000"),
        }
    }

    #[test]
    fn test_local_owner_always_self() {
        let fleet = vec![instance("node-a"), instance("node-b")];
        let picked = LocalOwner.select(&fleet, &InstanceId::from("node-b"));
        assert_eq!(picked.as_str(), "node-b");
    }

    #[test]
    fn test_least_loaded_picks_minimum() {
        let fleet = vec![instance("node-a"), instance("node-b"), instance("node-c")];
        let selector = LeastLoadedOwner::new(|id: &InstanceId| match id.as_str() {
            "node-a" => 5,
            "node-b" => 1,
            _ => 9,
        });
        let picked = selector.select(&fleet, &InstanceId::from("node-a"));
        assert_eq!(picked.as_str(), "node-b");
    }

    #[test]
    fn test_least_loaded_empty_fleet_falls_back_to_self() {
        let selector = LeastLoadedOwner::new(|_: &InstanceId| 0);
        let picked = selector.select(&[], &InstanceId::from("node-a"));
        assert_eq!(picked.as_str(), "node-a");
    }
}
