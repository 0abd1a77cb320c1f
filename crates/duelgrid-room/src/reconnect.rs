//! Disconnect grace periods.
//!
//! A combatant whose transport drops is not forfeited immediately:
//! their clocks pause, the opponent is told, and a grace timer starts.
//! Reconnecting inside the window cancels the timer, resumes the
//! clocks, flushes anything batched for the session, and resyncs the
//! client with full battle state. Letting the timer fire is treated
//! exactly like an explicit forfeit.
//!
//! Spectators never enter this machine; their disconnect is plain
//! unregistration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use duelgrid_cluster::{ClusterStateManager, ConnectionStatus, SessionMessenger};
use duelgrid_protocol::{session_key, ClientEvent, PlayerId, RoomId, SessionId};
use duelgrid_store::CoordStore;

use crate::RoomError;

/// What the grace machine needs from the room layer.
pub trait GraceActions: Send + Sync + 'static {
    /// Pauses the player's simulation clocks.
    fn pause_player(
        &self,
        room_id: &RoomId,
        player_id: &PlayerId,
    ) -> impl Future<Output = ()> + Send;

    /// Resumes the player's simulation clocks.
    fn resume_player(
        &self,
        room_id: &RoomId,
        player_id: &PlayerId,
    ) -> impl Future<Output = ()> + Send;

    /// Forfeits the player; the room ends in the opponent's favor.
    fn abandon_player(
        &self,
        room_id: &RoomId,
        player_id: &PlayerId,
    ) -> impl Future<Output = ()> + Send;

    /// Full battle state for a resync, if the room is hosted here.
    fn battle_state(
        &self,
        room_id: &RoomId,
        player_id: &PlayerId,
    ) -> impl Future<Output = Option<Value>> + Send;
}

/// Hook for draining batched-but-undelivered messages on reconnect.
pub trait PendingFlush: Send + Sync + 'static {
    fn flush_session(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
    ) -> impl Future<Output = ()> + Send;
}

/// For deployments or tests without a batcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPendingFlush;

impl PendingFlush for NoPendingFlush {
    async fn flush_session(&self, _player_id: &PlayerId, _session_id: &SessionId) {}
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// How long a dropped combatant may stay away.
    pub grace_period: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(60),
        }
    }
}

/// One session currently inside its grace window.
struct DisconnectedPlayerInfo {
    player_id: PlayerId,
    room_id: RoomId,
    disconnected_at: tokio::time::Instant,
    /// Cancelled on reconnect; firing means abandonment.
    grace_timer: JoinHandle<()>,
}

type GraceMap = Arc<Mutex<HashMap<String, DisconnectedPlayerInfo>>>;

pub struct ReconnectionManager<S, A, M, F> {
    state: ClusterStateManager<S>,
    actions: Arc<A>,
    messenger: Arc<M>,
    flush: Arc<F>,
    config: ReconnectConfig,
    in_grace: GraceMap,
}

impl<S, A, M, F> ReconnectionManager<S, A, M, F>
where
    S: CoordStore,
    A: GraceActions,
    M: SessionMessenger + 'static,
    F: PendingFlush,
{
    pub fn new(
        state: ClusterStateManager<S>,
        actions: Arc<A>,
        messenger: Arc<M>,
        flush: Arc<F>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            state,
            actions,
            messenger,
            flush,
            config,
            in_grace: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a session is currently inside its grace window.
    pub fn in_grace_period(&self, player_id: &PlayerId, session_id: &SessionId) -> bool {
        self.in_grace
            .lock()
            .expect("grace map poisoned")
            .contains_key(&session_key(player_id, session_id))
    }

    /// Milliseconds left in a session's grace window, if any.
    pub fn grace_remaining_ms(&self, player_id: &PlayerId, session_id: &SessionId) -> Option<u64> {
        let map = self.in_grace.lock().expect("grace map poisoned");
        let info = map.get(&session_key(player_id, session_id))?;
        let elapsed = info.disconnected_at.elapsed();
        Some(
            self.config
                .grace_period
                .saturating_sub(elapsed)
                .as_millis() as u64,
        )
    }

    /// Handles a transport drop for a session.
    pub async fn on_disconnect(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
    ) -> Result<(), RoomError> {
        let key = session_key(player_id, session_id);

        // Flip the shared connection record so matchmaking and routing
        // see the drop immediately.
        if let Some(mut connection) = self.state.get_connection(&key).await? {
            connection.status = ConnectionStatus::Disconnected;
            self.state.save_connection(player_id, &connection).await?;
        }

        let Some(room_id) = self.state.get_session_room(&key).await? else {
            // Not in a battle: plain unregistration.
            self.state.remove_connection(&key).await?;
            return Ok(());
        };
        let Some(room) = self.state.get_room(&room_id).await? else {
            self.state.remove_connection(&key).await?;
            return Ok(());
        };

        if !room.session_players.values().any(|p| p == player_id) {
            // Spectator: no grace, just drop.
            self.state.remove_connection(&key).await?;
            return Ok(());
        }

        self.actions.pause_player(&room_id, player_id).await;

        let grace_ms = self.config.grace_period.as_millis() as u64;
        self.notify_opponent(
            &room,
            player_id,
            ClientEvent::OpponentDisconnected {
                player_id: player_id.clone(),
                grace_remaining_ms: grace_ms,
            },
        )
        .await;

        let timer = self.spawn_grace_timer(key.clone());
        let info = DisconnectedPlayerInfo {
            player_id: player_id.clone(),
            room_id,
            disconnected_at: tokio::time::Instant::now(),
            grace_timer: timer,
        };
        if let Some(previous) = self
            .in_grace
            .lock()
            .expect("grace map poisoned")
            .insert(key, info)
        {
            previous.grace_timer.abort();
        }

        tracing::info!(%player_id, grace_ms, "combatant entered grace period");
        Ok(())
    }

    fn spawn_grace_timer(&self, key: String) -> JoinHandle<()> {
        let deadline = tokio::time::Instant::now() + self.config.grace_period;
        let in_grace = Arc::clone(&self.in_grace);
        let actions = Arc::clone(&self.actions);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Reconnect may have raced the timer; only the entry's
            // remover acts.
            let expired = in_grace.lock().expect("grace map poisoned").remove(&key);
            let Some(info) = expired else {
                return;
            };
            tracing::info!(
                player_id = %info.player_id,
                room_id = %info.room_id,
                "grace period expired, forfeiting"
            );
            actions.abandon_player(&info.room_id, &info.player_id).await;
        })
    }

    /// Handles a session coming back. Returns `true` if it was inside
    /// a grace window (i.e. a battle resumed).
    pub async fn on_reconnect(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
    ) -> Result<bool, RoomError> {
        let key = session_key(player_id, session_id);

        if let Some(mut connection) = self.state.get_connection(&key).await? {
            connection.status = ConnectionStatus::Connected;
            self.state.save_connection(player_id, &connection).await?;
        }

        let Some(info) = self
            .in_grace
            .lock()
            .expect("grace map poisoned")
            .remove(&key)
        else {
            return Ok(false);
        };
        info.grace_timer.abort();

        self.actions.resume_player(&info.room_id, player_id).await;
        self.flush.flush_session(player_id, session_id).await;

        if let Some(state) = self.actions.battle_state(&info.room_id, player_id).await {
            let resync = ClientEvent::BattleState {
                room_id: info.room_id.clone(),
                state,
            };
            if let Err(error) = self
                .messenger
                .send_to_session(player_id, session_id, resync)
                .await
            {
                tracing::warn!(%player_id, %error, "battle state resync failed");
            }
        }

        if let Some(room) = self.state.get_room(&info.room_id).await? {
            self.notify_opponent(
                &room,
                player_id,
                ClientEvent::OpponentReconnected {
                    player_id: player_id.clone(),
                },
            )
            .await;
        }

        tracing::info!(%player_id, room_id = %info.room_id, "combatant reconnected in grace");
        Ok(true)
    }

    async fn notify_opponent(
        &self,
        room: &duelgrid_cluster::RoomState,
        player_id: &PlayerId,
        event: ClientEvent,
    ) {
        let Some(opponent) = room.opponent_of(player_id) else {
            return;
        };
        let Some(opponent_session) = room.session_of(opponent) else {
            return;
        };
        let Some((_, session_id)) = opponent_session.split_once(':') else {
            return;
        };
        if let Err(error) = self
            .messenger
            .send_to_session(opponent, &SessionId::from(session_id), event)
            .await
        {
            tracing::debug!(%opponent, %error, "opponent notification failed");
        }
    }
}
