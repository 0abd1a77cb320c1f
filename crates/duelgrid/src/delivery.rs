//! Adapters that close the seams between the layers.
//!
//! The subcrates talk to each other through small capability traits so
//! none depends on another's concrete types: matchmaking asks a
//! [`RoomCreator`] for rooms, the batcher hands flushed events to a
//! [`BatchSink`], and the reconnection manager drains pending batches
//! through a [`PendingFlush`]. The types here wire those traits to the
//! real implementations for a running instance.

use std::sync::Arc;

use duelgrid_batch::{BatchSink, MessageBatcher, Recipient};
use duelgrid_cluster::{
    ClusterMessenger, ClusterStateManager, LocalDelivery, MatchmakingEntry, SessionMessenger,
};
use duelgrid_matchmaking::{MatchmakingError, RoomCreator};
use duelgrid_protocol::{ClientEvent, PlayerId, RoomId, SessionId};
use duelgrid_room::{PendingFlush, RoomService};
use duelgrid_store::{keys, CoordStore};

/// Lets matchmaking create rooms without a dependency on the room
/// crate. Room-layer failures surface as room-creation errors so the
/// sweep can log and move on.
pub struct RoomSpawner<S, M> {
    rooms: Arc<RoomService<S, M>>,
}

impl<S, M> RoomSpawner<S, M> {
    pub fn new(rooms: Arc<RoomService<S, M>>) -> Self {
        Self { rooms }
    }
}

impl<S, M> RoomCreator for RoomSpawner<S, M>
where
    S: CoordStore,
    M: SessionMessenger + 'static,
{
    async fn create_room(
        &self,
        first: &MatchmakingEntry,
        second: &MatchmakingEntry,
    ) -> Result<RoomId, MatchmakingError> {
        self.rooms
            .create_room(first, second)
            .await
            .map_err(|error| MatchmakingError::RoomCreation(error.to_string()))
    }
}

/// Where flushed batches leave the process: combatant batches go to the
/// session messenger, spectator batches onto the room's fan-out
/// channel for every instance with watchers.
pub struct EventSink<S, L> {
    messenger: ClusterMessenger<S, L>,
    state: ClusterStateManager<S>,
}

impl<S, L> EventSink<S, L> {
    pub fn new(messenger: ClusterMessenger<S, L>, state: ClusterStateManager<S>) -> Self {
        Self { messenger, state }
    }
}

impl<S: CoordStore, L: LocalDelivery> BatchSink for EventSink<S, L> {
    async fn deliver(&self, recipient: &Recipient, event: ClientEvent) {
        match recipient {
            Recipient::Session {
                player_id,
                session_id,
            } => {
                if let Err(error) = self
                    .messenger
                    .send_to_session(player_id, session_id, event)
                    .await
                {
                    tracing::warn!(%player_id, %error, "batched event delivery failed");
                }
            }
            Recipient::Spectators { room_id } => {
                let raw = match serde_json::to_string(&event) {
                    Ok(raw) => raw,
                    Err(error) => {
                        tracing::warn!(%room_id, %error, "unserializable spectator event");
                        return;
                    }
                };
                if let Err(error) = self
                    .state
                    .store()
                    .publish(&keys::chan_spectator(room_id), &raw)
                    .await
                {
                    tracing::warn!(%room_id, %error, "spectator fan-out failed");
                }
            }
        }
    }
}

/// Drains a session's pending batch when it reconnects, so nothing
/// coalesced during the outage is lost before the state resync.
pub struct BatchFlush<K> {
    batcher: MessageBatcher<K>,
}

impl<K> BatchFlush<K> {
    pub fn new(batcher: MessageBatcher<K>) -> Self {
        Self { batcher }
    }
}

impl<K: BatchSink> PendingFlush for BatchFlush<K> {
    async fn flush_session(&self, player_id: &PlayerId, session_id: &SessionId) {
        self.batcher.flush_session(player_id, session_id).await;
    }
}
