//! One running instance of the coordination service.
//!
//! [`BattleServer::start`] wires every layer together on top of a
//! shared coordination store: instance registration with heartbeats,
//! RPC client and server, the cross-instance messenger, room service
//! with its janitor, the leader-gated matchmaking sweep, the disconnect
//! grace machine, and the outbound batcher. The transport layer stays
//! outside; it hands sessions in through [`connect_session`] and
//! actions through [`route_action`].
//!
//! [`connect_session`]: BattleServer::connect_session
//! [`route_action`]: BattleServer::route_action

use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;

use duelgrid_batch::{BatcherConfig, MessageBatcher, Recipient};
use duelgrid_cluster::{
    epoch_ms, ClusterMessenger, ClusterStateManager, ConnectionStatus, HeartbeatProber,
    InstanceRegistry, LeaderElector, LocalDelivery, MatchmakingEntry, PlayerConnection,
    RegistryConfig, RpcClient, RpcConfig, RpcServer,
};
use duelgrid_matchmaking::{MatchingStrategy, MatchmakingConfig, MatchmakingService};
use duelgrid_protocol::{
    BattleMessage, InstanceId, PlayerId, RpcAction, SessionId, TimerSnapshot,
};
use duelgrid_room::{ReconnectConfig, ReconnectionManager, RoomConfig, RoomService, SimulationFactory};
use duelgrid_store::{CoordStore, LockManager};

use crate::delivery::{BatchFlush, EventSink, RoomSpawner};
use crate::ServerError;

/// Everything tunable on an instance, with production defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub instance_id: InstanceId,
    /// Advertised in the registry so peers can name this instance in
    /// diagnostics. RPC itself runs over the store's pub/sub.
    pub rpc_address: String,
    pub registry: RegistryConfig,
    pub rpc: RpcConfig,
    pub matchmaking: MatchmakingConfig,
    pub room: RoomConfig,
    pub reconnect: ReconnectConfig,
    pub batcher: BatcherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let instance_id =
            InstanceId::from(format!("instance-{:08x}", rand::rng().random::<u32>()));
        Self {
            instance_id,
            rpc_address: "127.0.0.1:9000".to_string(),
            registry: RegistryConfig::default(),
            rpc: RpcConfig::default(),
            matchmaking: MatchmakingConfig::default(),
            room: RoomConfig::default(),
            reconnect: ReconnectConfig::default(),
            batcher: BatcherConfig::default(),
        }
    }
}

type Rooms<S, L> = RoomService<S, ClusterMessenger<S, L>>;
type Matchmaker<S, L> = MatchmakingService<
    S,
    HeartbeatProber,
    RoomSpawner<S, ClusterMessenger<S, L>>,
    ClusterMessenger<S, L>,
>;
type Reconnector<S, L> =
    ReconnectionManager<S, Rooms<S, L>, ClusterMessenger<S, L>, BatchFlush<EventSink<S, L>>>;

/// Builder for configuring and starting an instance.
pub struct BattleServerBuilder {
    config: ServerConfig,
    strategies: Vec<(String, Arc<dyn MatchingStrategy>)>,
}

impl BattleServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            strategies: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.config.instance_id = id.into();
        self
    }

    pub fn rpc_address(mut self, address: impl Into<String>) -> Self {
        self.config.rpc_address = address.into();
        self
    }

    /// Registers a matching strategy for one rule set. Unregistered
    /// rule sets match FIFO.
    pub fn strategy(
        mut self,
        rule_set_id: impl Into<String>,
        strategy: Arc<dyn MatchingStrategy>,
    ) -> Self {
        self.strategies.push((rule_set_id.into(), strategy));
        self
    }

    /// Registers with the cluster and spawns every background task.
    pub async fn start<S, L>(
        self,
        store: Arc<S>,
        transport: Arc<L>,
        factory: Arc<dyn SimulationFactory>,
    ) -> Result<BattleServer<S, L>, ServerError>
    where
        S: CoordStore,
        L: LocalDelivery,
    {
        let config = self.config;
        let state = ClusterStateManager::new(Arc::clone(&store));
        let mut tasks = Vec::new();

        let registry = InstanceRegistry::new(
            Arc::clone(&store),
            config.instance_id.clone(),
            config.rpc_address.clone(),
            config.registry.clone(),
        );
        registry.register().await?;
        tasks.push(registry.spawn_heartbeat());

        let messenger =
            ClusterMessenger::new(state.clone(), config.instance_id.clone(), transport);
        tasks.push(messenger.spawn_message_listener().await?);

        let rpc = RpcClient::new(
            Arc::clone(&store),
            config.instance_id.clone(),
            config.rpc.clone(),
        );
        tasks.push(rpc.spawn_response_listener().await?);

        let rooms = Arc::new(RoomService::new(
            state.clone(),
            LockManager::new(Arc::clone(&store)),
            registry.clone(),
            rpc,
            factory,
            Arc::new(messenger.clone()),
            config.room.clone(),
        ));
        let rpc_server = RpcServer::new(
            Arc::clone(&store),
            config.instance_id.clone(),
            Arc::clone(&rooms),
        );
        tasks.push(rpc_server.spawn().await?);
        tasks.push(rooms.spawn_janitor());
        tasks.push(rooms.spawn_cleanup_listener().await?);

        let sink = Arc::new(EventSink::new(messenger.clone(), state.clone()));
        let batcher = MessageBatcher::new(sink, config.batcher.clone());

        let heartbeat_interval = config.registry.heartbeat_interval;
        let elect = || {
            LeaderElector::new(
                registry.clone(),
                LockManager::new(Arc::clone(&store)),
                HeartbeatProber::new(heartbeat_interval),
            )
        };

        let mut matchmaking = MatchmakingService::new(
            state.clone(),
            LockManager::new(Arc::clone(&store)),
            elect(),
            Arc::new(RoomSpawner::new(Arc::clone(&rooms))),
            Arc::new(messenger.clone()),
            config.matchmaking.clone(),
        );
        for (rule_set_id, strategy) in self.strategies {
            matchmaking = matchmaking.with_strategy(rule_set_id, strategy);
        }
        let matchmaking = Arc::new(matchmaking);
        tasks.push(matchmaking.spawn_sweep_loop());

        let reconnect = ReconnectionManager::new(
            state.clone(),
            Arc::clone(&rooms),
            Arc::new(messenger.clone()),
            Arc::new(BatchFlush::new(batcher.clone())),
            config.reconnect.clone(),
        );

        tracing::info!(instance_id = %config.instance_id, "instance started");
        Ok(BattleServer {
            elector: elect(),
            config,
            state,
            registry,
            rooms,
            matchmaking,
            reconnect,
            batcher,
            tasks,
        })
    }
}

impl Default for BattleServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running instance. Dropping it leaks its background tasks; call
/// [`shutdown`](Self::shutdown) to leave the cluster cleanly.
pub struct BattleServer<S: CoordStore, L: LocalDelivery> {
    config: ServerConfig,
    state: ClusterStateManager<S>,
    registry: InstanceRegistry<S>,
    elector: LeaderElector<S, HeartbeatProber>,
    rooms: Arc<Rooms<S, L>>,
    matchmaking: Arc<Matchmaker<S, L>>,
    reconnect: Reconnector<S, L>,
    batcher: MessageBatcher<EventSink<S, L>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: CoordStore, L: LocalDelivery> BattleServer<S, L> {
    pub fn builder() -> BattleServerBuilder {
        BattleServerBuilder::new()
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.config.instance_id
    }

    pub fn rooms(&self) -> &Arc<Rooms<S, L>> {
        &self.rooms
    }

    pub fn matchmaking(&self) -> &Arc<Matchmaker<S, L>> {
        &self.matchmaking
    }

    pub fn batcher(&self) -> &MessageBatcher<EventSink<S, L>> {
        &self.batcher
    }

    /// Whether this instance currently holds the matchmaking role.
    pub async fn is_leader(&self) -> Result<bool, ServerError> {
        Ok(self.elector.is_leader().await?)
    }

    // -- session lifecycle --------------------------------------------

    /// Records a client session as connected to this instance. Returns
    /// `true` if the session was inside a disconnect grace window and
    /// its battle resumed.
    pub async fn connect_session(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        socket_id: &str,
    ) -> Result<bool, ServerError> {
        let connection = PlayerConnection {
            instance_id: self.config.instance_id.clone(),
            socket_id: socket_id.to_string(),
            session_id: session_id.clone(),
            last_seen: epoch_ms(),
            status: ConnectionStatus::Connected,
        };
        self.state.save_connection(player_id, &connection).await?;
        Ok(self.reconnect.on_reconnect(player_id, session_id).await?)
    }

    /// Handles a transport drop: combatants get a grace window,
    /// everyone else is plainly unregistered.
    pub async fn disconnect_session(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
    ) -> Result<(), ServerError> {
        Ok(self.reconnect.on_disconnect(player_id, session_id).await?)
    }

    /// Whether a session is inside its disconnect grace window.
    pub fn in_grace_period(&self, player_id: &PlayerId, session_id: &SessionId) -> bool {
        self.reconnect.in_grace_period(player_id, session_id)
    }

    // -- matchmaking --------------------------------------------------

    pub async fn enqueue_matchmaking(&self, entry: MatchmakingEntry) -> Result<(), ServerError> {
        Ok(self.matchmaking.enqueue(entry).await?)
    }

    pub async fn cancel_matchmaking(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        rule_set_id: &str,
    ) -> Result<bool, ServerError> {
        Ok(self
            .matchmaking
            .cancel(player_id, session_id, rule_set_id)
            .await?)
    }

    // -- battle actions -----------------------------------------------

    /// Routes a player action into its battle, wherever it lives.
    pub async fn route_action(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        action: RpcAction,
        payload: Value,
    ) -> Result<Value, ServerError> {
        Ok(self
            .rooms
            .route_action(player_id, session_id, action, payload)
            .await?)
    }

    // -- outbound events ----------------------------------------------

    /// Queues a battle message for batched delivery.
    pub async fn queue_event(&self, recipient: Recipient, message: BattleMessage) {
        self.batcher.add(recipient, message).await;
    }

    /// Queues a timer snapshot; only the latest per player survives
    /// until the flush.
    pub fn queue_timer_snapshot(&self, recipient: Recipient, snapshot: TimerSnapshot) {
        self.batcher.add_timer_snapshot(recipient, snapshot);
    }

    // -- shutdown -----------------------------------------------------

    /// Stops background work, flushes pending batches, and leaves the
    /// registry so peers stop routing here.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.batcher.flush_all().await;
        self.registry.deregister().await?;
        tracing::info!(instance_id = %self.config.instance_id, "instance stopped");
        Ok(())
    }
}
