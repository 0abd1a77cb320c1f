//! Cross-instance routing: an action submitted from a non-owning
//! instance must behave exactly like one submitted locally.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use duelgrid_cluster::{
    epoch_ms, ClusterError, ClusterStateManager, InstanceRegistry, MatchmakingEntry,
    RegistryConfig, RoomState, RpcClient, RpcConfig, RpcServer, SessionMessenger,
};
use duelgrid_cluster::ServiceInstance;
use duelgrid_protocol::{InstanceId, PlayerId, RoomId, RpcAction, SessionId, TimerSnapshot};
use duelgrid_room::{
    BattleSimulation, LocalOwner, OwnerSelector, RoomConfig, RoomService, SimulationError,
    SimulationFactory,
};
use duelgrid_store::{LockManager, MemoryStore};

struct CountingSim {
    moves: Vec<Value>,
}

impl BattleSimulation for CountingSim {
    fn submit_selection(
        &mut self,
        _player_id: &PlayerId,
        selection: &Value,
    ) -> Result<(), SimulationError> {
        self.moves.push(selection.clone());
        Ok(())
    }

    fn available_selections(&self, _player_id: &PlayerId) -> Result<Value, SimulationError> {
        Ok(json!(["attack"]))
    }

    fn state_for(&self, _player_id: &PlayerId) -> Result<Value, SimulationError> {
        Ok(json!({ "moves": self.moves.len() }))
    }

    fn player_ready(&mut self, _player_id: &PlayerId) {}

    fn abandon(&mut self, _player_id: &PlayerId) {}

    fn is_finished(&self) -> bool {
        false
    }

    fn winner(&self) -> Option<PlayerId> {
        None
    }

    fn timer_enabled(&self) -> bool {
        false
    }

    fn pause_timer(&mut self, _player_id: &PlayerId) {}

    fn resume_timer(&mut self, _player_id: &PlayerId) {}

    fn timer_state(&self, _player_id: &PlayerId) -> Option<TimerSnapshot> {
        None
    }

    fn all_timer_states(&self) -> Vec<TimerSnapshot> {
        Vec::new()
    }

    fn timer_config(&self) -> Value {
        Value::Null
    }

    fn start_animation(
        &mut self,
        _player_id: &PlayerId,
        _data: &Value,
    ) -> Result<u64, SimulationError> {
        Ok(1)
    }

    fn end_animation(&mut self, _animation_id: u64) {}

    fn report_animation_end(&mut self, _player_id: &PlayerId, _data: &Value) {}
}

struct CountingFactory;

impl SimulationFactory for CountingFactory {
    fn create(&self, _room: &RoomState) -> Box<dyn BattleSimulation> {
        Box::new(CountingSim { moves: Vec::new() })
    }
}

#[derive(Default)]
struct SilentMessenger {
    sent: Mutex<usize>,
}

impl SessionMessenger for SilentMessenger {
    async fn send_to_session(
        &self,
        _player_id: &PlayerId,
        _session_id: &SessionId,
        _event: duelgrid_protocol::ClientEvent,
    ) -> Result<(), ClusterError> {
        *self.sent.lock().unwrap() += 1;
        Ok(())
    }
}

/// Placement pinned to a fixed instance, reachable or not.
struct PinnedOwner(&'static str);

impl OwnerSelector for PinnedOwner {
    fn select(&self, _fleet: &[ServiceInstance], _self_id: &InstanceId) -> InstanceId {
        InstanceId::from(self.0)
    }
}

async fn node(
    store: &Arc<MemoryStore>,
    id: &str,
) -> Arc<RoomService<MemoryStore, SilentMessenger>> {
    node_with_selector(store, id, Box::new(LocalOwner)).await
}

async fn node_with_selector(
    store: &Arc<MemoryStore>,
    id: &str,
    selector: Box<dyn OwnerSelector>,
) -> Arc<RoomService<MemoryStore, SilentMessenger>> {
    let registry = InstanceRegistry::new(
        Arc::clone(store),
        id.into(),
        format!("{id}:9000"),
        RegistryConfig::default(),
    );
    registry.register().await.unwrap();

    let rpc = RpcClient::new(Arc::clone(store), id.into(), RpcConfig::default());
    rpc.spawn_response_listener().await.unwrap();

    let service = Arc::new(
        RoomService::new(
            ClusterStateManager::new(Arc::clone(store)),
            LockManager::new(Arc::clone(store)),
            registry,
            rpc,
            Arc::new(CountingFactory),
            Arc::new(SilentMessenger::default()),
            RoomConfig::default(),
        )
        .with_owner_selector(selector),
    );

    let server = RpcServer::new(Arc::clone(store), id.into(), Arc::clone(&service));
    server.spawn().await.unwrap();
    service
}

fn entry(player: &str, session: &str) -> MatchmakingEntry {
    MatchmakingEntry {
        player_id: PlayerId::from(player),
        session_id: SessionId::from(session),
        rule_set_id: "standard".to_string(),
        join_time: epoch_ms(),
        player_data: json!({}),
        metadata: None,
    }
}

#[tokio::test]
async fn test_remote_action_equivalent_to_local() {
    let store = Arc::new(MemoryStore::new());
    let owner = node(&store, "node-a").await;
    let other = node(&store, "node-b").await;

    // node-a creates (and therefore owns) the room.
    owner
        .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
        .await
        .unwrap();

    // p1 acts through the owner, p2 through the other instance.
    let local = owner
        .route_action(
            &PlayerId::from("p1"),
            &SessionId::from("s1"),
            RpcAction::SubmitPlayerSelection,
            json!({ "move": "tackle" }),
        )
        .await
        .unwrap();
    let remote = other
        .route_action(
            &PlayerId::from("p2"),
            &SessionId::from("s2"),
            RpcAction::SubmitPlayerSelection,
            json!({ "move": "growl" }),
        )
        .await
        .unwrap();
    assert_eq!(local, remote);

    // Both selections landed in the one simulation on node-a, and both
    // instances read back the same state.
    let via_owner = owner
        .route_action(
            &PlayerId::from("p1"),
            &SessionId::from("s1"),
            RpcAction::GetBattleState,
            Value::Null,
        )
        .await
        .unwrap();
    let via_other = other
        .route_action(
            &PlayerId::from("p2"),
            &SessionId::from("s2"),
            RpcAction::GetBattleState,
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(via_owner["battleState"]["moves"], 2);
    assert_eq!(via_owner, via_other);
}

#[tokio::test]
async fn test_remote_placement_owner_hosts_simulation() {
    let store = Arc::new(MemoryStore::new());
    let host = node(&store, "node-b").await;
    // node-a's placement pins node-b, so creation is delegated there.
    let creator = node_with_selector(&store, "node-a", Box::new(PinnedOwner("node-b"))).await;

    let room_id = creator
        .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
        .await
        .unwrap();

    let state = ClusterStateManager::new(Arc::clone(&store));
    let room = state.get_room(&room_id).await.unwrap().unwrap();
    assert_eq!(room.instance_id.as_str(), "node-b");
    assert!(host.hosts_simulation(&room_id));
    assert!(!creator.hosts_simulation(&room_id));

    // The first action on the fresh room works from either side.
    let via_creator = creator
        .route_action(
            &PlayerId::from("p1"),
            &SessionId::from("s1"),
            RpcAction::GetBattleState,
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(via_creator["battleState"]["moves"], 0);
    let via_host = host
        .route_action(
            &PlayerId::from("p2"),
            &SessionId::from("s2"),
            RpcAction::GetBattleState,
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(via_creator, via_host);
}

#[tokio::test]
async fn test_remote_placement_falls_back_local_when_owner_unavailable() {
    let store = Arc::new(MemoryStore::new());
    let creator = node_with_selector(&store, "node-a", Box::new(PinnedOwner("node-ghost"))).await;

    let room_id = creator
        .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
        .await
        .unwrap();

    // The pinned owner was never registered, so the creator hosts.
    let state = ClusterStateManager::new(Arc::clone(&store));
    let room = state.get_room(&room_id).await.unwrap().unwrap();
    assert_eq!(room.instance_id.as_str(), "node-a");
    assert!(creator.hosts_simulation(&room_id));
}

#[tokio::test]
async fn test_remote_create_battle_delegation() {
    let store = Arc::new(MemoryStore::new());
    let owner = node(&store, "node-a").await;
    let other = node(&store, "node-b").await;

    // node-b asks node-a to create the battle on its behalf.
    let rpc = RpcClient::new(
        Arc::clone(&store),
        "node-probe".into(),
        RpcConfig::default(),
    );
    rpc.spawn_response_listener().await.unwrap();
    let response = rpc
        .call(
            &"node-a".into(),
            RpcAction::CreateBattle,
            RoomId::from(""),
            PlayerId::from("p1"),
            json!({
                "player1": entry("p1", "s1"),
                "player2": entry("p2", "s2"),
            }),
        )
        .await
        .unwrap();
    assert!(response.success);
    let room_id = response.data.unwrap()["roomId"].as_str().unwrap().to_string();

    // The room lives on node-a; node-b can still route into it.
    assert!(owner.hosts_simulation(&RoomId::from(room_id.as_str())));
    let state = other
        .route_action(
            &PlayerId::from("p1"),
            &SessionId::from("s1"),
            RpcAction::GetBattleState,
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(state["battleState"]["moves"], 0);
}
