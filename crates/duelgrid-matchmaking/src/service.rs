//! The matchmaking service: queues in, rooms out.
//!
//! Enqueue/cancel run on every instance. The sweep runs only on the
//! elected leader, under the global matchmaking lock, and every chosen
//! pair is re-verified under a pair-scoped lock before a room is
//! created. That re-verification is what makes a duplicate leader or a
//! duplicate sweep harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use duelgrid_cluster::{
    epoch_ms, ClusterStateManager, LeaderElector, MatchmakingEntry, ReachabilityProber,
    SessionMessenger, SessionStateFlag,
};
use duelgrid_protocol::{ClientEvent, PlayerId, RoomId, SessionId};
use duelgrid_store::{keys, CoordStore, LockError, LockManager, LockOptions};

use crate::{FifoStrategy, MatchingStrategy, MatchmakingConfig, MatchmakingError};

/// Capability to turn a matched pair into a live room. The room layer
/// provides the real implementation; tests provide a recorder.
pub trait RoomCreator: Send + Sync {
    fn create_room(
        &self,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> impl Future<Output = Result<RoomId, MatchmakingError>> + Send;
}

pub struct MatchmakingService<S, P, R, M> {
    state: ClusterStateManager<S>,
    locks: LockManager<S>,
    elector: LeaderElector<S, P>,
    rooms: Arc<R>,
    messenger: Arc<M>,
    config: MatchmakingConfig,
    strategies: HashMap<String, Arc<dyn MatchingStrategy>>,
    default_strategy: Arc<dyn MatchingStrategy>,
}

impl<S, P, R, M> MatchmakingService<S, P, R, M>
where
    S: CoordStore,
    P: ReachabilityProber + Send + Sync + 'static,
    R: RoomCreator + 'static,
    M: SessionMessenger + 'static,
{
    pub fn new(
        state: ClusterStateManager<S>,
        locks: LockManager<S>,
        elector: LeaderElector<S, P>,
        rooms: Arc<R>,
        messenger: Arc<M>,
        config: MatchmakingConfig,
    ) -> Self {
        Self {
            state,
            locks,
            elector,
            rooms,
            messenger,
            config,
            strategies: HashMap::new(),
            default_strategy: Arc::new(FifoStrategy),
        }
    }

    /// Registers a strategy for one rule set. Unregistered rule sets
    /// fall back to FIFO.
    pub fn with_strategy(
        mut self,
        rule_set_id: impl Into<String>,
        strategy: Arc<dyn MatchingStrategy>,
    ) -> Self {
        self.strategies.insert(rule_set_id.into(), strategy);
        self
    }

    fn strategy_for(&self, rule_set_id: &str) -> &Arc<dyn MatchingStrategy> {
        self.strategies
            .get(rule_set_id)
            .unwrap_or(&self.default_strategy)
    }

    // -- queue operations ---------------------------------------------

    /// Puts a session into its rule set's queue.
    pub async fn enqueue(&self, mut entry: MatchmakingEntry) -> Result<(), MatchmakingError> {
        let session_key = entry.session_key();

        let flag = self.state.get_session_state(&session_key).await?;
        if matches!(flag, SessionStateFlag::PrivateRoom | SessionStateFlag::Battle) {
            return Err(MatchmakingError::SessionStateConflict {
                session_key,
                state: flag,
            });
        }
        if !self.state.is_connected(&session_key).await? {
            return Err(MatchmakingError::SessionNotConnected(session_key));
        }

        // Re-queueing replaces any previous entry for the session.
        self.state.dequeue(&entry.rule_set_id, &session_key).await?;

        entry.join_time = epoch_ms();
        self.state.enqueue(&entry).await?;
        self.state
            .set_session_state(&session_key, SessionStateFlag::Matchmaking)
            .await?;

        tracing::info!(
            player_id = %entry.player_id,
            rule_set_id = %entry.rule_set_id,
            "session queued for matchmaking"
        );

        // Nudge the leader so fresh pairs do not wait a full interval.
        self.state
            .store()
            .publish(keys::CHAN_MATCHMAKING_EVENTS, &entry.rule_set_id)
            .await
            .map_err(duelgrid_cluster::ClusterError::from)?;
        Ok(())
    }

    /// Takes a session out of the queue.
    pub async fn cancel(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        rule_set_id: &str,
    ) -> Result<bool, MatchmakingError> {
        let session_key = duelgrid_protocol::session_key(player_id, session_id);
        let removed = self.state.dequeue(rule_set_id, &session_key).await?;
        if removed {
            self.state
                .set_session_state(&session_key, SessionStateFlag::Idle)
                .await?;
            tracing::info!(%player_id, rule_set_id, "matchmaking cancelled");
        }
        Ok(removed)
    }

    // -- sweep --------------------------------------------------------

    /// Runs the background sweep loop: periodic ticks plus enqueue
    /// nudges over the matchmaking events channel. Leadership is
    /// re-checked on every iteration.
    pub fn spawn_sweep_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = match service
                .state
                .store()
                .subscribe(keys::CHAN_MATCHMAKING_EVENTS)
                .await
            {
                Ok(sub) => sub,
                Err(error) => {
                    tracing::error!(%error, "cannot subscribe to matchmaking events");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let forced = tokio::select! {
                    _ = ticker.tick() => false,
                    nudge = events.recv() => {
                        if nudge.is_none() {
                            return;
                        }
                        true
                    }
                };
                match service.elector.is_leader().await {
                    Ok(true) => {
                        if let Err(error) = service.sweep_once(forced).await {
                            tracing::warn!(%error, "matchmaking sweep failed");
                        }
                    }
                    Ok(false) => {}
                    Err(error) => tracing::warn!(%error, "leader check failed"),
                }
            }
        })
    }

    /// One sweep pass under the global matchmaking lock. At most one
    /// rule set produces a match per pass, bounding sweep latency.
    pub async fn sweep_once(&self, forced: bool) -> Result<(), MatchmakingError> {
        let result = self
            .locks
            .with_lock(keys::LOCK_MATCHMAKING, || self.sweep_rule_sets(forced))
            .await;
        match result {
            Ok(inner) => inner,
            // Another sweep is in flight; this one is redundant.
            Err(LockError::Timeout { .. }) => Ok(()),
            Err(err) => Err(duelgrid_cluster::ClusterError::from(err).into()),
        }
    }

    async fn sweep_rule_sets(&self, forced: bool) -> Result<(), MatchmakingError> {
        let now_ms = epoch_ms();
        for rule_set_id in self.state.active_rule_sets().await? {
            let mut entries = self.state.queue_entries(&rule_set_id).await?;
            self.prune_stale(&rule_set_id, &mut entries, now_ms).await?;

            let strategy = self.strategy_for(&rule_set_id);
            if entries.len() < 2 {
                continue;
            }
            if !forced && !strategy.is_ready(&entries, now_ms) {
                continue;
            }
            let Some((i, j)) = strategy.select_pair(&entries, now_ms) else {
                continue;
            };
            let first = entries[i].clone();
            let second = entries[j].clone();

            if self.try_pair(&rule_set_id, &first, &second).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Dequeues entries that overstayed or lost their connection.
    async fn prune_stale(
        &self,
        rule_set_id: &str,
        entries: &mut Vec<MatchmakingEntry>,
        now_ms: u64,
    ) -> Result<(), MatchmakingError> {
        let max_wait_ms = self.config.max_wait_time.as_millis() as u64;
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            let session_key = entry.session_key();
            let connected = self.state.is_connected(&session_key).await?;
            if connected && entry.wait_ms(now_ms) <= max_wait_ms {
                kept.push(entry);
                continue;
            }
            tracing::info!(
                player_id = %entry.player_id,
                rule_set_id,
                connected,
                "dequeuing stale matchmaking entry"
            );
            self.state.dequeue(rule_set_id, &session_key).await?;
            self.state
                .set_session_state(&session_key, SessionStateFlag::Idle)
                .await?;
        }
        *entries = kept;
        Ok(())
    }

    /// Locks the pair, re-verifies both sides, and creates the room.
    /// Returns `true` if a match was made.
    async fn try_pair(
        &self,
        rule_set_id: &str,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> Result<bool, MatchmakingError> {
        let pair_lock = keys::lock_match_pair(&first.session_key(), &second.session_key());
        let lock_options = LockOptions {
            ttl: Duration::from_secs(30),
            retry_count: 0,
            retry_delay: Duration::from_millis(100),
        };
        let result = self
            .locks
            .with_lock_opts(&pair_lock, &lock_options, || {
                self.pair_locked(rule_set_id, first, second)
            })
            .await;
        match result {
            Ok(inner) => inner,
            // Someone else is pairing these two right now.
            Err(LockError::Timeout { .. }) => Ok(false),
            Err(err) => Err(duelgrid_cluster::ClusterError::from(err).into()),
        }
    }

    async fn pair_locked(
        &self,
        rule_set_id: &str,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> Result<bool, MatchmakingError> {
        // A duplicate sweep may have matched either side already, and a
        // connection may have dropped since selection. Re-verify both.
        for entry in [first, second] {
            let session_key = entry.session_key();
            if !self.state.is_queued(rule_set_id, &session_key).await? {
                return Ok(false);
            }
            if !self.state.is_connected(&session_key).await? {
                self.state.dequeue(rule_set_id, &session_key).await?;
                self.state
                    .set_session_state(&session_key, SessionStateFlag::Idle)
                    .await?;
                return Ok(false);
            }
        }

        let room_id = self.rooms.create_room(first, second).await?;

        for entry in [first, second] {
            let session_key = entry.session_key();
            self.state.dequeue(rule_set_id, &session_key).await?;
            self.state
                .set_session_state(&session_key, SessionStateFlag::Battle)
                .await?;
        }

        tracing::info!(
            %room_id,
            rule_set_id,
            first = %first.player_id,
            second = %second.player_id,
            "match formed"
        );

        for (entry, opponent) in [(first, second), (second, first)] {
            let event = ClientEvent::MatchSuccess {
                room_id: room_id.clone(),
                opponent_id: opponent.player_id.clone(),
            };
            if let Err(error) = self
                .messenger
                .send_to_session(&entry.player_id, &entry.session_id, event)
                .await
            {
                tracing::warn!(player_id = %entry.player_id, %error, "match notification failed");
            }
        }
        Ok(true)
    }
}
