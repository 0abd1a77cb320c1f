//! Room lifecycle and the action router.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use duelgrid_cluster::{
    ActionHandler, ClusterError, ClusterStateManager, InstanceRegistry, MatchmakingEntry,
    RoomMetadata, RoomState, RoomStatus, RpcClient, SessionMessenger, SessionStateFlag,
};
use duelgrid_protocol::{
    session_key, ClientEvent, ErrorCode, InstanceId, PlayerId, RoomId, RpcAction, RpcRequest,
    RpcResponse, SessionId,
};
use duelgrid_store::{keys, CoordStore, LockManager, LockOptions};

use crate::placement::{LocalOwner, OwnerSelector};
use crate::simulation::{BattleSimulation, SimulationFactory};
use crate::{RoomConfig, RoomError};

/// Simulations hosted by this instance, one per owned room.
type SimMap = Arc<Mutex<HashMap<RoomId, Box<dyn BattleSimulation>>>>;

/// What to do after the simulation lock is released.
enum AfterAction {
    Nothing,
    FinishRoom,
    TerminateRoom { reason: String },
}

pub struct RoomService<S, M> {
    state: ClusterStateManager<S>,
    locks: LockManager<S>,
    registry: InstanceRegistry<S>,
    rpc: RpcClient<S>,
    messenger: Arc<M>,
    factory: Arc<dyn SimulationFactory>,
    sims: SimMap,
    owner_selector: Box<dyn OwnerSelector>,
    config: RoomConfig,
    self_id: InstanceId,
}

impl<S: CoordStore, M: SessionMessenger + 'static> RoomService<S, M> {
    pub fn new(
        state: ClusterStateManager<S>,
        locks: LockManager<S>,
        registry: InstanceRegistry<S>,
        rpc: RpcClient<S>,
        factory: Arc<dyn SimulationFactory>,
        messenger: Arc<M>,
        config: RoomConfig,
    ) -> Self {
        let self_id = registry.self_id().clone();
        Self {
            state,
            locks,
            registry,
            rpc,
            messenger,
            factory,
            sims: Arc::new(Mutex::new(HashMap::new())),
            owner_selector: Box::new(LocalOwner),
            config,
            self_id,
        }
    }

    /// Replaces the default keep-it-local placement policy.
    pub fn with_owner_selector(mut self, selector: Box<dyn OwnerSelector>) -> Self {
        self.owner_selector = selector;
        self
    }

    pub fn self_id(&self) -> &InstanceId {
        &self.self_id
    }

    /// Whether this instance is currently hosting the room's simulation.
    pub fn hosts_simulation(&self, room_id: &RoomId) -> bool {
        self.sims.lock().expect("sim map poisoned").contains_key(room_id)
    }

    // -- creation -----------------------------------------------------

    /// Materializes a room for a matched pair.
    ///
    /// Idempotent per session pair: a duplicate sweep that calls this
    /// again gets the already-created room back. The reverse index is
    /// written before the room record so a just-matched player's first
    /// action can always resolve its room.
    pub async fn create_room(
        &self,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> Result<RoomId, RoomError> {
        let k1 = first.session_key();
        let k2 = second.session_key();
        let pair = if k1 <= k2 {
            format!("{k1}:{k2}")
        } else {
            format!("{k2}:{k1}")
        };

        let result = self
            .locks
            .with_lock_opts(
                &keys::lock_room_create(&pair),
                &LockOptions::default(),
                || self.create_room_locked(first, second, &k1, &k2),
            )
            .await;
        match result {
            Ok(inner) => inner,
            Err(err) => Err(RoomError::Cluster(ClusterError::from(err))),
        }
    }

    async fn create_room_locked(
        &self,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
        k1: &str,
        k2: &str,
    ) -> Result<RoomId, RoomError> {
        // A previous call (duplicate sweep, retried RPC) may have won.
        if let Some(existing) = self.existing_room_for(k1).await? {
            tracing::debug!(room_id = %existing, "room already exists for pair");
            return Ok(existing);
        }

        let fleet = self.registry.instances().await?;
        let owner = self.owner_selector.select(&fleet, &self.self_id);

        // The owner must host the simulation. A remotely placed room is
        // created end to end on the owner; if it cannot, the match is
        // not lost: the room is hosted here instead.
        if owner != self.self_id {
            match self.delegate_creation(&owner, first, second).await {
                Ok(room_id) => return Ok(room_id),
                Err(error) => {
                    tracing::warn!(
                        owner = %owner,
                        %error,
                        "creation delegation failed, hosting locally"
                    );
                }
            }
        }

        self.create_room_hosted(first, second, k1, k2).await
    }

    /// The already-created room for a pair member, if its record is
    /// still live.
    async fn existing_room_for(&self, session: &str) -> Result<Option<RoomId>, RoomError> {
        if let Some(existing) = self.state.get_session_room(session).await? {
            if self.state.get_room(&existing).await?.is_some() {
                return Ok(Some(existing));
            }
        }
        Ok(None)
    }

    /// Asks `owner` to create the room on itself. The pair lock is held
    /// across this call, so the remote side creates without taking it.
    async fn delegate_creation(
        &self,
        owner: &InstanceId,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> Result<RoomId, RoomError> {
        if !self.registry.is_registered(owner).await? {
            return Err(ClusterError::InstanceUnavailable(owner.to_string()).into());
        }

        let response = self
            .rpc
            .call(
                owner,
                RpcAction::CreateBattle,
                RoomId::from(""),
                first.player_id.clone(),
                json!({ "player1": first, "player2": second }),
            )
            .await?;
        if !response.success {
            return Err(RoomError::Remote {
                code: response.error.unwrap_or(ErrorCode::Internal),
                message: response.message.unwrap_or_default(),
            });
        }

        let data = response.data.unwrap_or(Value::Null);
        match data.get("roomId").and_then(Value::as_str) {
            Some(id) => Ok(RoomId::from(id)),
            None => Err(RoomError::Remote {
                code: ErrorCode::Internal,
                message: "create-battle reply carried no room id".to_string(),
            }),
        }
    }

    /// Creates the room on this instance, which becomes its owner and
    /// hosts the simulation.
    async fn create_room_hosted(
        &self,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
        k1: &str,
        k2: &str,
    ) -> Result<RoomId, RoomError> {
        let n = self.state.store().incr(keys::ROOM_COUNTER).await.map_err(ClusterError::from)?;
        let room_id = RoomId::from(format!("room-{n}"));

        // Reverse index before room state: the room must be resolvable
        // the instant it becomes visible.
        self.state.set_session_room(k1, &room_id).await?;
        self.state.set_session_room(k2, &room_id).await?;

        let mut room = RoomState {
            id: room_id.clone(),
            instance_id: self.self_id.clone(),
            status: RoomStatus::Waiting,
            sessions: vec![k1.to_string(), k2.to_string()],
            session_players: HashMap::from([
                (k1.to_string(), first.player_id.clone()),
                (k2.to_string(), second.player_id.clone()),
            ]),
            spectators: Vec::new(),
            last_active: 0,
            metadata: RoomMetadata {
                rule_set_id: first.rule_set_id.clone(),
                battle_record_id: None,
                private_room: false,
            },
        };
        self.state.save_room(&mut room).await?;

        let sim = self.factory.create(&room);
        self.sims
            .lock()
            .expect("sim map poisoned")
            .insert(room_id.clone(), sim);

        self.state
            .store()
            .publish(
                keys::CHAN_BATTLE_CREATED,
                &json!({
                    "roomId": room_id,
                    "instanceId": self.self_id,
                    "spectators": room.spectators,
                })
                .to_string(),
            )
            .await
            .map_err(ClusterError::from)?;

        tracing::info!(
            %room_id,
            first = %first.player_id,
            second = %second.player_id,
            "room created"
        );
        Ok(room_id)
    }

    // -- routing ------------------------------------------------------

    /// Routes a player action to the instance owning their room.
    pub async fn route_action(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        action: RpcAction,
        payload: Value,
    ) -> Result<Value, RoomError> {
        let key = session_key(player_id, session_id);
        let Some(room_id) = self.state.get_session_room(&key).await? else {
            return Err(RoomError::NoActiveRoom(key));
        };
        let Some(room) = self.state.get_room(&room_id).await? else {
            // Stale reverse index; clean it so the next call fails fast.
            self.state.clear_session_room(&key).await?;
            return Err(RoomError::NotFound(room_id));
        };

        if room.instance_id == self.self_id {
            self.handle_local(&room, action, player_id, payload).await
        } else {
            self.dispatch_remote(room, action, player_id, payload).await
        }
    }

    async fn dispatch_remote(
        &self,
        room: RoomState,
        action: RpcAction,
        player_id: &PlayerId,
        payload: Value,
    ) -> Result<Value, RoomError> {
        if !self.registry.is_registered(&room.instance_id).await? {
            return self.orphan_fallback(&room, action).await;
        }

        match self
            .rpc
            .call(
                &room.instance_id,
                action,
                room.id.clone(),
                player_id.clone(),
                payload,
            )
            .await
        {
            Ok(response) if response.success => Ok(response.data.unwrap_or(Value::Null)),
            Ok(response) => Err(RoomError::Remote {
                code: response.error.unwrap_or(ErrorCode::Internal),
                message: response.message.unwrap_or_default(),
            }),
            Err(ClusterError::InstanceUnavailable(_)) => {
                self.orphan_fallback(&room, action).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The owner is gone: reap the room and, for idempotent actions,
    /// answer neutrally instead of bubbling an error at the client.
    async fn orphan_fallback(
        &self,
        room: &RoomState,
        action: RpcAction,
    ) -> Result<Value, RoomError> {
        tracing::warn!(
            room_id = %room.id,
            owner = %room.instance_id,
            "room is orphaned, cleaning up"
        );
        self.cleanup_orphan(room).await?;
        if action.is_idempotent() {
            Ok(json!({ "status": "ok" }))
        } else {
            Err(RoomError::NotFound(room.id.clone()))
        }
    }

    // -- local action handling ----------------------------------------

    async fn handle_local(
        &self,
        room: &RoomState,
        action: RpcAction,
        player_id: &PlayerId,
        payload: Value,
    ) -> Result<Value, RoomError> {
        if !room.session_players.values().any(|p| p == player_id) {
            return Err(RoomError::PlayerMismatch {
                room_id: room.id.clone(),
                player_id: player_id.clone(),
            });
        }

        let (result, after) = {
            let mut sims = self.sims.lock().expect("sim map poisoned");
            let Some(sim) = sims.get_mut(&room.id) else {
                return Err(RoomError::NotFound(room.id.clone()));
            };
            self.apply_action(sim.as_mut(), action, player_id, &payload)?
        };

        match after {
            AfterAction::Nothing => {}
            AfterAction::FinishRoom => {
                self.terminate_room(&room.id, "battle_finished").await?;
            }
            AfterAction::TerminateRoom { reason } => {
                self.terminate_room(&room.id, &reason).await?;
            }
        }

        if matches!(action, RpcAction::PlayerReady) {
            self.activate_if_waiting(&room.id).await?;
        }

        Ok(result)
    }

    /// Runs one action against the simulation. Synchronous; the sim
    /// lock is held for exactly this call.
    fn apply_action(
        &self,
        sim: &mut dyn BattleSimulation,
        action: RpcAction,
        player_id: &PlayerId,
        payload: &Value,
    ) -> Result<(Value, AfterAction), RoomError> {
        let ok = json!({ "status": "ok" });
        let result = match action {
            RpcAction::SubmitPlayerSelection => {
                sim.submit_selection(player_id, payload)?;
                if sim.is_finished() {
                    return Ok((ok, AfterAction::FinishRoom));
                }
                ok
            }
            RpcAction::GetAvailableSelection => {
                json!({ "selections": sim.available_selections(player_id)? })
            }
            RpcAction::GetBattleState => {
                json!({ "battleState": sim.state_for(player_id)? })
            }
            RpcAction::PlayerReady => {
                sim.player_ready(player_id);
                ok
            }
            RpcAction::PlayerAbandon => {
                sim.abandon(player_id);
                return Ok((
                    ok,
                    AfterAction::TerminateRoom {
                        reason: "abandoned".to_string(),
                    },
                ));
            }
            RpcAction::ReportAnimationEnd => {
                sim.report_animation_end(player_id, payload);
                ok
            }
            RpcAction::StartAnimation => {
                let id = sim.start_animation(player_id, payload)?;
                json!({ "id": id })
            }
            RpcAction::EndAnimation => {
                if let Some(id) = payload.get("id").and_then(Value::as_u64) {
                    sim.end_animation(id);
                }
                ok
            }
            RpcAction::IsTimerEnabled => json!({ "enabled": sim.timer_enabled() }),
            RpcAction::GetPlayerTimerState => json!(sim.timer_state(player_id)),
            RpcAction::GetAllPlayerTimerStates => json!(sim.all_timer_states()),
            RpcAction::GetTimerConfig => sim.timer_config(),
            RpcAction::TerminateBattle => {
                let reason = payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("terminated")
                    .to_string();
                return Ok((ok, AfterAction::TerminateRoom { reason }));
            }
            // Creation does not go through a simulation.
            RpcAction::CreateBattle => {
                return Err(RoomError::Remote {
                    code: ErrorCode::Internal,
                    message: "create-battle is not a room action".to_string(),
                });
            }
        };
        Ok((result, AfterAction::Nothing))
    }

    async fn activate_if_waiting(&self, room_id: &RoomId) -> Result<(), RoomError> {
        if let Some(mut room) = self.state.get_room(room_id).await? {
            if room.status == RoomStatus::Waiting {
                room.status = RoomStatus::Active;
                self.state.save_room(&mut room).await?;
            }
        }
        Ok(())
    }

    // -- termination & cleanup ----------------------------------------

    /// Ends a room: marks it ended, tells every combatant, and leaves
    /// the record around briefly so clients can process the close.
    pub async fn terminate_room(&self, room_id: &RoomId, reason: &str) -> Result<(), RoomError> {
        let Some(mut room) = self.state.get_room(room_id).await? else {
            return Ok(());
        };
        if room.status == RoomStatus::Ended {
            return Ok(());
        }
        room.status = RoomStatus::Ended;
        self.state.save_room(&mut room).await?;

        tracing::info!(%room_id, reason, "room terminated");
        self.notify_room_closed(&room, reason).await;

        self.state
            .store()
            .publish(keys::CHAN_ROOM_CLEANUP, &json!({ "roomId": room_id }).to_string())
            .await
            .map_err(ClusterError::from)?;

        // Delayed purge: bounded window for clients to see the close.
        let state = self.state.clone();
        let sims = Arc::clone(&self.sims);
        let deadline = tokio::time::Instant::now() + self.config.ended_linger;
        let room_id = room_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Err(error) = Self::purge_room(&state, &sims, &room_id).await {
                tracing::warn!(%room_id, %error, "delayed room purge failed");
            }
        });
        Ok(())
    }

    /// Removes a room's record, reverse indices, session flags, and the
    /// local simulation if hosted here. Idempotent.
    async fn purge_room(
        state: &ClusterStateManager<S>,
        sims: &SimMap,
        room_id: &RoomId,
    ) -> Result<(), RoomError> {
        if let Some(room) = state.get_room(room_id).await? {
            for session in &room.sessions {
                state
                    .set_session_state(session, SessionStateFlag::Idle)
                    .await?;
            }
        }
        state.delete_room(room_id).await?;
        sims.lock().expect("sim map poisoned").remove(room_id);
        Ok(())
    }

    async fn notify_room_closed(&self, room: &RoomState, reason: &str) {
        for (session, player_id) in &room.session_players {
            let Some((_, session_id)) = session.split_once(':') else {
                continue;
            };
            let event = ClientEvent::RoomClosed {
                room_id: room.id.clone(),
                reason: reason.to_string(),
            };
            if let Err(error) = self
                .messenger
                .send_to_session(player_id, &SessionId::from(session_id), event)
                .await
            {
                tracing::debug!(%player_id, %error, "room-closed notification failed");
            }
        }
    }

    /// Reaps one orphaned room: tells the (possibly resurrecting)
    /// owner to discard local state, then deletes everything.
    pub async fn cleanup_orphan(&self, room: &RoomState) -> Result<(), RoomError> {
        self.state
            .store()
            .publish(
                &keys::chan_instance_cleanup(&room.instance_id),
                &json!({ "roomId": room.id }).to_string(),
            )
            .await
            .map_err(ClusterError::from)?;
        self.notify_room_closed(room, "instance_unavailable").await;
        Self::purge_room(&self.state, &self.sims, &room.id).await
    }

    /// Reaps every room owned by a crashed instance.
    pub async fn handle_instance_crash(&self, crashed: &InstanceId) -> Result<usize, RoomError> {
        let rooms = self.state.rooms_on_instance(crashed).await?;
        let count = rooms.len();
        for room in rooms {
            if let Err(error) = self.cleanup_orphan(&room).await {
                tracing::warn!(room_id = %room.id, %error, "orphan cleanup failed");
            }
        }
        if count > 0 {
            tracing::warn!(instance_id = %crashed, count, "cleaned rooms of crashed instance");
        }
        Ok(count)
    }

    // -- background tasks ---------------------------------------------

    /// Watches for crashed owners and over-age rooms. One periodic
    /// task covers both since they walk the same room list.
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = service.janitor_pass().await {
                    tracing::warn!(%error, "room janitor pass failed");
                }
            }
        })
    }

    async fn janitor_pass(&self) -> Result<(), RoomError> {
        let rooms = self.state.all_rooms().await?;
        let now = duelgrid_cluster::epoch_ms();

        let mut dead_owners: HashSet<InstanceId> = HashSet::new();
        for room in &rooms {
            if dead_owners.contains(&room.instance_id) {
                continue;
            }
            if !self.registry.is_registered(&room.instance_id).await? {
                dead_owners.insert(room.instance_id.clone());
            }
        }
        for owner in &dead_owners {
            self.handle_instance_crash(owner).await?;
        }

        for room in rooms {
            if dead_owners.contains(&room.instance_id) {
                continue;
            }
            let age_ms = now.saturating_sub(room.last_active);
            let max_age = match room.status {
                RoomStatus::Ended => self.config.ended_linger,
                RoomStatus::Waiting => self.config.waiting_max_age,
                RoomStatus::Active => self.config.active_max_age,
            };
            if age_ms > max_age.as_millis() as u64 {
                tracing::info!(room_id = %room.id, status = ?room.status, "reaping expired room");
                Self::purge_room(&self.state, &self.sims, &room.id).await?;
            }
        }
        Ok(())
    }

    /// Listens for cleanup orders addressed to this instance and drops
    /// the named local simulations. Duplicate orders no-op.
    pub async fn spawn_cleanup_listener(&self) -> Result<JoinHandle<()>, RoomError> {
        let mut subscription = self
            .state
            .store()
            .subscribe(&keys::chan_instance_cleanup(&self.self_id))
            .await
            .map_err(ClusterError::from)?;
        let sims = Arc::clone(&self.sims);
        Ok(tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let Ok(value) = serde_json::from_str::<Value>(&raw) else {
                    continue;
                };
                let Some(room_id) = value.get("roomId").and_then(Value::as_str) else {
                    continue;
                };
                let removed = sims
                    .lock()
                    .expect("sim map poisoned")
                    .remove(&RoomId::from(room_id));
                if removed.is_some() {
                    tracing::info!(room_id, "dropped local simulation on cleanup order");
                }
            }
        }))
    }
}

impl<S: CoordStore, M: SessionMessenger + 'static> crate::GraceActions for RoomService<S, M> {
    async fn pause_player(&self, room_id: &RoomId, player_id: &PlayerId) {
        let mut sims = self.sims.lock().expect("sim map poisoned");
        if let Some(sim) = sims.get_mut(room_id) {
            sim.pause_timer(player_id);
        }
    }

    async fn resume_player(&self, room_id: &RoomId, player_id: &PlayerId) {
        let mut sims = self.sims.lock().expect("sim map poisoned");
        if let Some(sim) = sims.get_mut(room_id) {
            sim.resume_timer(player_id);
        }
    }

    async fn abandon_player(&self, room_id: &RoomId, player_id: &PlayerId) {
        let room = match self.state.get_room(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%room_id, %error, "abandon lookup failed");
                return;
            }
        };
        if let Err(error) = self
            .handle_local(&room, RpcAction::PlayerAbandon, player_id, Value::Null)
            .await
        {
            tracing::warn!(%room_id, %player_id, %error, "forfeit on grace timeout failed");
        }
    }

    async fn battle_state(&self, room_id: &RoomId, player_id: &PlayerId) -> Option<Value> {
        let sims = self.sims.lock().expect("sim map poisoned");
        sims.get(room_id).and_then(|sim| sim.state_for(player_id).ok())
    }
}

impl<S: CoordStore, M: SessionMessenger + 'static> ActionHandler for RoomService<S, M> {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let request_id = request.request_id.clone();
        match self.execute_request(request).await {
            Ok(data) => RpcResponse::ok(request_id, data),
            Err(err) => RpcResponse::err(request_id, err.code(), err.to_string()),
        }
    }
}

impl<S: CoordStore, M: SessionMessenger + 'static> RoomService<S, M> {
    async fn execute_request(&self, request: RpcRequest) -> Result<Value, RoomError> {
        if request.action == RpcAction::CreateBattle {
            let first: MatchmakingEntry = serde_json::from_value(
                request
                    .payload
                    .get("player1")
                    .cloned()
                    .unwrap_or(Value::Null),
            )
            .map_err(ClusterError::from)?;
            let second: MatchmakingEntry = serde_json::from_value(
                request
                    .payload
                    .get("player2")
                    .cloned()
                    .unwrap_or(Value::Null),
            )
            .map_err(ClusterError::from)?;
            // The delegating instance holds the pair creation lock for
            // the duration of this request. Create here without it, and
            // without consulting placement again.
            let k1 = first.session_key();
            let k2 = second.session_key();
            if let Some(existing) = self.existing_room_for(&k1).await? {
                return Ok(json!({ "roomId": existing }));
            }
            let room_id = self.create_room_hosted(&first, &second, &k1, &k2).await?;
            return Ok(json!({ "roomId": room_id }));
        }

        let Some(room) = self.state.get_room(&request.room_id).await? else {
            return Err(RoomError::NotFound(request.room_id));
        };
        if room.instance_id != self.self_id {
            // We were asked to act on a room we no longer own.
            return Err(RoomError::NotFound(room.id));
        }
        self.handle_local(&room, request.action, &request.player_id, request.payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use duelgrid_cluster::{epoch_ms, ConnectionStatus, PlayerConnection, RegistryConfig, RpcConfig};
    use duelgrid_protocol::TimerSnapshot;
    use duelgrid_store::MemoryStore;

    use crate::simulation::SimulationError;

    struct FakeSim {
        players: Vec<PlayerId>,
        selections: Vec<Value>,
        finished: bool,
        winner: Option<PlayerId>,
        paused: Vec<PlayerId>,
        next_animation: u64,
    }

    impl FakeSim {
        fn new(players: Vec<PlayerId>) -> Self {
            Self {
                players,
                selections: Vec::new(),
                finished: false,
                winner: None,
                paused: Vec::new(),
                next_animation: 1,
            }
        }
    }

    impl BattleSimulation for FakeSim {
        fn submit_selection(
            &mut self,
            player_id: &PlayerId,
            selection: &Value,
        ) -> Result<(), SimulationError> {
            if selection.get("illegal").is_some() {
                return Err(SimulationError::InvalidSelection("illegal move".into()));
            }
            self.selections.push(selection.clone());
            if selection.get("winning").is_some() {
                self.finished = true;
                self.winner = Some(player_id.clone());
            }
            Ok(())
        }

        fn available_selections(&self, _player_id: &PlayerId) -> Result<Value, SimulationError> {
            Ok(json!(["attack", "switch"]))
        }

        fn state_for(&self, player_id: &PlayerId) -> Result<Value, SimulationError> {
            Ok(json!({ "viewer": player_id, "moves": self.selections.len() }))
        }

        fn player_ready(&mut self, _player_id: &PlayerId) {}

        fn abandon(&mut self, player_id: &PlayerId) {
            self.finished = true;
            self.winner = self.players.iter().find(|p| *p != player_id).cloned();
        }

        fn is_finished(&self) -> bool {
            self.finished
        }

        fn winner(&self) -> Option<PlayerId> {
            self.winner.clone()
        }

        fn timer_enabled(&self) -> bool {
            true
        }

        fn pause_timer(&mut self, player_id: &PlayerId) {
            self.paused.push(player_id.clone());
        }

        fn resume_timer(&mut self, player_id: &PlayerId) {
            self.paused.retain(|p| p != player_id);
        }

        fn timer_state(&self, player_id: &PlayerId) -> Option<TimerSnapshot> {
            Some(TimerSnapshot {
                player_id: player_id.clone(),
                remaining_turn_ms: 30_000,
                remaining_total_ms: 600_000,
                running: !self.paused.contains(player_id),
            })
        }

        fn all_timer_states(&self) -> Vec<TimerSnapshot> {
            self.players
                .iter()
                .filter_map(|p| self.timer_state(p))
                .collect()
        }

        fn timer_config(&self) -> Value {
            json!({ "turnMs": 30_000, "totalMs": 600_000 })
        }

        fn start_animation(
            &mut self,
            _player_id: &PlayerId,
            _data: &Value,
        ) -> Result<u64, SimulationError> {
            let id = self.next_animation;
            self.next_animation += 1;
            Ok(id)
        }

        fn end_animation(&mut self, _animation_id: u64) {}

        fn report_animation_end(&mut self, _player_id: &PlayerId, _data: &Value) {}
    }

    struct FakeFactory;

    impl SimulationFactory for FakeFactory {
        fn create(&self, room: &RoomState) -> Box<dyn BattleSimulation> {
            Box::new(FakeSim::new(room.session_players.values().cloned().collect()))
        }
    }

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(String, ClientEvent)>>,
    }

    impl SessionMessenger for RecordingMessenger {
        async fn send_to_session(
            &self,
            player_id: &PlayerId,
            _session_id: &SessionId,
            event: ClientEvent,
        ) -> Result<(), ClusterError> {
            self.sent.lock().unwrap().push((player_id.to_string(), event));
            Ok(())
        }
    }

    type TestService = RoomService<MemoryStore, RecordingMessenger>;

    async fn build(store: &Arc<MemoryStore>, id: &str) -> (Arc<TestService>, Arc<RecordingMessenger>) {
        let registry = InstanceRegistry::new(
            Arc::clone(store),
            InstanceId::from(id),
            format!("{id}:9000"),
            RegistryConfig::default(),
        );
        registry.register().await.unwrap();
        let messenger = Arc::new(RecordingMessenger::default());
        let rpc = RpcClient::new(Arc::clone(store), InstanceId::from(id), RpcConfig::default());
        rpc.spawn_response_listener().await.unwrap();
        let service = Arc::new(RoomService::new(
            ClusterStateManager::new(Arc::clone(store)),
            LockManager::new(Arc::clone(store)),
            registry,
            rpc,
            Arc::new(FakeFactory),
            Arc::clone(&messenger),
            RoomConfig::default(),
        ));
        (service, messenger)
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

    async fn seed_connection(store: &Arc<MemoryStore>, instance: &str, player: &str, session: &str) {
        let state = ClusterStateManager::new(Arc::clone(store));
        state
            .save_connection(
                &PlayerId::from(player),
                &PlayerConnection {
                    instance_id: InstanceId::from(instance),
                    socket_id: format!("sock-{player}"),
                    session_id: SessionId::from(session),
                    last_seen: epoch_ms(),
                    status: ConnectionStatus::Connected,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_room_writes_state_and_indices() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;

        let room_id = service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        let state = ClusterStateManager::new(Arc::clone(&store));
        let room = state.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.instance_id.as_str(), "node-a");
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(
            state.get_session_room("p1:s1").await.unwrap().unwrap(),
            room_id
        );
        assert_eq!(
            state.get_session_room("p2:s2").await.unwrap().unwrap(),
            room_id
        );
        assert!(service.hosts_simulation(&room_id));
    }

    #[tokio::test]
    async fn test_create_room_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;

        let first = service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();
        let second = service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        assert_eq!(first, second);
        let state = ClusterStateManager::new(Arc::clone(&store));
        assert_eq!(state.all_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_action_local_reaches_simulation() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;
        service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        let result = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::SubmitPlayerSelection,
                json!({ "move": "tackle" }),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");

        let state = service
            .route_action(
                &PlayerId::from("p2"),
                &SessionId::from("s2"),
                RpcAction::GetBattleState,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(state["battleState"]["moves"], 1);
    }

    #[tokio::test]
    async fn test_route_action_invalid_selection_rejected() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;
        service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        let err = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::SubmitPlayerSelection,
                json!({ "illegal": true }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSelection);
    }

    #[tokio::test]
    async fn test_route_action_without_room_fails() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;

        let err = service
            .route_action(
                &PlayerId::from("ghost"),
                &SessionId::from("s1"),
                RpcAction::GetBattleState,
                Value::Null,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomNotFound);
    }

    #[tokio::test]
    async fn test_route_action_player_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;
        let room_id = service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        // An intruder's reverse index points at someone else's room.
        let state = ClusterStateManager::new(Arc::clone(&store));
        state.set_session_room("intruder:s7", &room_id).await.unwrap();

        let err = service
            .route_action(
                &PlayerId::from("intruder"),
                &SessionId::from("s7"),
                RpcAction::SubmitPlayerSelection,
                json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PlayerIdMismatch);
    }

    #[tokio::test]
    async fn test_orphaned_room_idempotent_action_neutral_success() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;
        seed_connection(&store, "node-a", "p1", "s1").await;

        // A room owned by an instance that was never registered.
        let state = ClusterStateManager::new(Arc::clone(&store));
        let mut room = RoomState {
            id: RoomId::from("room-orphan"),
            instance_id: InstanceId::from("node-dead"),
            status: RoomStatus::Active,
            sessions: vec!["p1:s1".into(), "p2:s2".into()],
            session_players: HashMap::from([
                ("p1:s1".to_string(), PlayerId::from("p1")),
                ("p2:s2".to_string(), PlayerId::from("p2")),
            ]),
            spectators: Vec::new(),
            last_active: 0,
            metadata: RoomMetadata {
                rule_set_id: "standard".into(),
                battle_record_id: None,
                private_room: false,
            },
        };
        state.save_room(&mut room).await.unwrap();
        state.set_session_room("p1:s1", &room.id).await.unwrap();
        state.set_session_room("p2:s2", &room.id).await.unwrap();

        let result = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::PlayerReady,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");

        // The orphan is gone; the next attempt fails fast.
        assert!(state.get_room(&room.id).await.unwrap().is_none());
        let err = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::GetBattleState,
                Value::Null,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomNotFound);
    }

    #[tokio::test]
    async fn test_orphaned_room_non_idempotent_action_errors() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;

        let state = ClusterStateManager::new(Arc::clone(&store));
        let mut room = RoomState {
            id: RoomId::from("room-orphan"),
            instance_id: InstanceId::from("node-dead"),
            status: RoomStatus::Active,
            sessions: vec!["p1:s1".into()],
            session_players: HashMap::from([("p1:s1".to_string(), PlayerId::from("p1"))]),
            spectators: Vec::new(),
            last_active: 0,
            metadata: RoomMetadata {
                rule_set_id: "standard".into(),
                battle_record_id: None,
                private_room: false,
            },
        };
        state.save_room(&mut room).await.unwrap();
        state.set_session_room("p1:s1", &room.id).await.unwrap();

        let err = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::SubmitPlayerSelection,
                json!({}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_room_notifies_then_purges() {
        let store = Arc::new(MemoryStore::new());
        let (service, messenger) = build(&store, "node-a").await;
        let room_id = service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        service.terminate_room(&room_id, "battle_finished").await.unwrap();

        let state = ClusterStateManager::new(Arc::clone(&store));
        let room = state.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Ended);

        let sent = messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|(_, e)| matches!(e, ClientEvent::RoomClosed { .. })));

        // After the linger window everything is gone.
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(state.get_room(&room_id).await.unwrap().is_none());
        assert!(state.get_session_room("p1:s1").await.unwrap().is_none());
        assert!(!service.hosts_simulation(&room_id));
    }

    #[tokio::test]
    async fn test_winning_selection_ends_the_room() {
        let store = Arc::new(MemoryStore::new());
        let (service, messenger) = build(&store, "node-a").await;
        let room_id = service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::SubmitPlayerSelection,
                json!({ "winning": true }),
            )
            .await
            .unwrap();

        let state = ClusterStateManager::new(Arc::clone(&store));
        let room = state.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Ended);
        assert!(!messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_janitor_reaps_rooms_of_dead_instance() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;

        let state = ClusterStateManager::new(Arc::clone(&store));
        let mut room = RoomState {
            id: RoomId::from("room-x"),
            instance_id: InstanceId::from("node-dead"),
            status: RoomStatus::Active,
            sessions: vec!["p1:s1".into()],
            session_players: HashMap::from([("p1:s1".to_string(), PlayerId::from("p1"))]),
            spectators: Vec::new(),
            last_active: 0,
            metadata: RoomMetadata {
                rule_set_id: "standard".into(),
                battle_record_id: None,
                private_room: false,
            },
        };
        state.save_room(&mut room).await.unwrap();
        state.set_session_room("p1:s1", &room.id).await.unwrap();

        service.janitor_pass().await.unwrap();

        assert!(state.get_room(&room.id).await.unwrap().is_none());
        assert!(state.get_session_room("p1:s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timer_queries() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = build(&store, "node-a").await;
        service
            .create_room(&entry("p1", "s1"), &entry("p2", "s2"))
            .await
            .unwrap();

        let enabled = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::IsTimerEnabled,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(enabled["enabled"], true);

        let all = service
            .route_action(
                &PlayerId::from("p1"),
                &SessionId::from("s1"),
                RpcAction::GetAllPlayerTimerStates,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
    }
}
