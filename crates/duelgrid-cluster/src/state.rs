//! Shared cluster state: rooms, queues, connections, session flags.
//!
//! All records are JSON strings in the coordination store. Reads are
//! lock-free and may be slightly stale; writers that need exclusivity
//! (room creation, matchmaking pairing) take a lock at a higher layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use duelgrid_protocol::{session_key, InstanceId, PlayerId, RoomId, SessionId};
use duelgrid_store::{keys, CoordStore};

use crate::instance::epoch_ms;
use crate::ClusterError;

// ---------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Active,
    Ended,
}

/// A spectator bound to a room, identified by player and session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatorRef {
    pub player_id: PlayerId,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    pub rule_set_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battle_record_id: Option<String>,
    #[serde(default)]
    pub private_room: bool,
}

/// Authoritative description of one battle room.
///
/// `instance_id` pins simulation ownership: exactly one instance runs
/// the battle at any moment, and every action must reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub id: RoomId,
    pub instance_id: InstanceId,
    pub status: RoomStatus,
    /// Session keys of the two combatants.
    pub sessions: Vec<String>,
    /// Session key to the player holding that session.
    pub session_players: HashMap<String, PlayerId>,
    #[serde(default)]
    pub spectators: Vec<SpectatorRef>,
    pub last_active: u64,
    pub metadata: RoomMetadata,
}

impl RoomState {
    /// The player on the other side of the given player, if both
    /// combatants are known.
    pub fn opponent_of(&self, player_id: &PlayerId) -> Option<&PlayerId> {
        self.session_players.values().find(|p| *p != player_id)
    }

    /// Looks up a combatant's session key by player id.
    pub fn session_of(&self, player_id: &PlayerId) -> Option<&str> {
        self.session_players
            .iter()
            .find(|(_, p)| *p == player_id)
            .map(|(k, _)| k.as_str())
    }
}

/// A waiting matchmaking queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingEntry {
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub rule_set_id: String,
    pub join_time: u64,
    /// Opaque per-player payload (team, rating, preferences).
    pub player_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MatchmakingEntry {
    pub fn session_key(&self) -> String {
        session_key(&self.player_id, &self.session_id)
    }

    /// Milliseconds this entry has been waiting as of `now_ms`.
    pub fn wait_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.join_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Where one player session's socket currently lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConnection {
    pub instance_id: InstanceId,
    pub socket_id: String,
    pub session_id: SessionId,
    pub last_seen: u64,
    pub status: ConnectionStatus,
}

/// Coarse mutual-exclusion flag for what a session is doing. Prevents
/// a session from queueing while already in a room, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateFlag {
    Idle,
    Matchmaking,
    PrivateRoom,
    Battle,
}

// ---------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------

/// CRUD over the shared records above.
pub struct ClusterStateManager<S> {
    store: Arc<S>,
    /// TTL for connection records; refreshed on client heartbeat.
    connection_ttl: Duration,
}

impl<S> Clone for ClusterStateManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            connection_ttl: self.connection_ttl,
        }
    }
}

impl<S: CoordStore> ClusterStateManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            connection_ttl: Duration::from_secs(120),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // -- rooms --------------------------------------------------------

    /// Persists a room, stamping `last_active`.
    pub async fn save_room(&self, room: &mut RoomState) -> Result<(), ClusterError> {
        room.last_active = epoch_ms();
        self.store
            .set(&keys::room(&room.id), &serde_json::to_string(room)?, None)
            .await?;
        Ok(())
    }

    pub async fn get_room(&self, id: &RoomId) -> Result<Option<RoomState>, ClusterError> {
        match self.store.get(&keys::room(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Deletes a room and every reverse index pointing at it.
    pub async fn delete_room(&self, id: &RoomId) -> Result<(), ClusterError> {
        if let Some(room) = self.get_room(id).await? {
            for session in &room.sessions {
                self.store.del(&keys::session_room(session)).await?;
            }
        }
        self.store.del(&keys::room(id)).await?;
        Ok(())
    }

    /// Lists every room record in the store.
    pub async fn all_rooms(&self) -> Result<Vec<RoomState>, ClusterError> {
        let mut rooms = Vec::new();
        for key in self.store.scan(keys::ROOM_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<RoomState>(&raw) {
                Ok(room) => rooms.push(room),
                Err(error) => {
                    tracing::warn!(%key, %error, "skipping malformed room record");
                }
            }
        }
        Ok(rooms)
    }

    /// Lists rooms owned by a specific instance, for crash cleanup.
    pub async fn rooms_on_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<RoomState>, ClusterError> {
        let mut rooms = self.all_rooms().await?;
        rooms.retain(|r| r.instance_id == *instance_id);
        Ok(rooms)
    }

    // -- session -> room reverse index --------------------------------

    pub async fn set_session_room(
        &self,
        session_key: &str,
        room_id: &RoomId,
    ) -> Result<(), ClusterError> {
        self.store
            .set(&keys::session_room(session_key), room_id.as_str(), None)
            .await?;
        Ok(())
    }

    pub async fn get_session_room(
        &self,
        session_key: &str,
    ) -> Result<Option<RoomId>, ClusterError> {
        Ok(self
            .store
            .get(&keys::session_room(session_key))
            .await?
            .map(RoomId::from))
    }

    pub async fn clear_session_room(&self, session_key: &str) -> Result<(), ClusterError> {
        self.store.del(&keys::session_room(session_key)).await?;
        Ok(())
    }

    // -- player connections -------------------------------------------

    pub async fn save_connection(
        &self,
        player_id: &PlayerId,
        connection: &PlayerConnection,
    ) -> Result<(), ClusterError> {
        let key = keys::player_connection(&session_key(player_id, &connection.session_id));
        self.store
            .set(
                &key,
                &serde_json::to_string(connection)?,
                Some(self.connection_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn get_connection(
        &self,
        session_key: &str,
    ) -> Result<Option<PlayerConnection>, ClusterError> {
        match self.store.get(&keys::player_connection(session_key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_connection(&self, session_key: &str) -> Result<(), ClusterError> {
        self.store.del(&keys::player_connection(session_key)).await?;
        Ok(())
    }

    /// Whether a session currently has a live, connected socket.
    pub async fn is_connected(&self, session_key: &str) -> Result<bool, ClusterError> {
        Ok(self
            .get_connection(session_key)
            .await?
            .is_some_and(|c| c.status == ConnectionStatus::Connected))
    }

    // -- session state flags ------------------------------------------

    pub async fn get_session_state(
        &self,
        session_key: &str,
    ) -> Result<SessionStateFlag, ClusterError> {
        match self.store.get(&keys::session_state(session_key)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(SessionStateFlag::Idle),
        }
    }

    pub async fn set_session_state(
        &self,
        session_key: &str,
        state: SessionStateFlag,
    ) -> Result<(), ClusterError> {
        if state == SessionStateFlag::Idle {
            self.store.del(&keys::session_state(session_key)).await?;
        } else {
            self.store
                .set(
                    &keys::session_state(session_key),
                    &serde_json::to_string(&state)?,
                    None,
                )
                .await?;
        }
        Ok(())
    }

    // -- matchmaking queues -------------------------------------------

    /// Appends an entry to its rule set's queue and marks the rule set
    /// active so sweeps know to visit it.
    pub async fn enqueue(&self, entry: &MatchmakingEntry) -> Result<(), ClusterError> {
        self.store
            .list_push(&keys::queue(&entry.rule_set_id), &serde_json::to_string(entry)?)
            .await?;
        self.store
            .set_add(keys::ACTIVE_RULE_SETS, &entry.rule_set_id)
            .await?;
        Ok(())
    }

    /// Reads a queue in join order. Malformed entries are purged.
    pub async fn queue_entries(
        &self,
        rule_set_id: &str,
    ) -> Result<Vec<MatchmakingEntry>, ClusterError> {
        let key = keys::queue(rule_set_id);
        let mut entries = Vec::new();
        for raw in self.store.list_all(&key).await? {
            match serde_json::from_str::<MatchmakingEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(error) => {
                    tracing::warn!(rule_set_id, %error, "purging malformed queue entry");
                    self.store.list_remove(&key, &raw).await?;
                }
            }
        }
        Ok(entries)
    }

    /// Removes every queue entry belonging to a session key. Returns
    /// `true` if anything was removed.
    pub async fn dequeue(
        &self,
        rule_set_id: &str,
        session_key: &str,
    ) -> Result<bool, ClusterError> {
        let key = keys::queue(rule_set_id);
        let mut removed = false;
        for raw in self.store.list_all(&key).await? {
            let matches = serde_json::from_str::<MatchmakingEntry>(&raw)
                .map(|e| e.session_key() == session_key)
                .unwrap_or(false);
            if matches {
                removed |= self.store.list_remove(&key, &raw).await? > 0;
            }
        }
        Ok(removed)
    }

    /// Whether a session key is still present in a queue.
    pub async fn is_queued(
        &self,
        rule_set_id: &str,
        session_key: &str,
    ) -> Result<bool, ClusterError> {
        Ok(self
            .queue_entries(rule_set_id)
            .await?
            .iter()
            .any(|e| e.session_key() == session_key))
    }

    /// Rule sets that have seen at least one enqueue.
    pub async fn active_rule_sets(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.store.set_members(keys::ACTIVE_RULE_SETS).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duelgrid_store::MemoryStore;

    fn manager() -> ClusterStateManager<MemoryStore> {
        ClusterStateManager::new(Arc::new(MemoryStore::new()))
    }

    fn sample_room(id: &str, instance: &str) -> RoomState {
        let p1 = PlayerId::from("p1");
        let p2 = PlayerId::from("p2");
        let k1 = session_key(&p1, &SessionId::from("s1"));
        let k2 = session_key(&p2, &SessionId::from("s2"));
        RoomState {
            id: RoomId::from(id),
            instance_id: InstanceId::from(instance),
            status: RoomStatus::Active,
            sessions: vec![k1.clone(), k2.clone()],
            session_players: HashMap::from([(k1, p1), (k2, p2)]),
            spectators: Vec::new(),
            last_active: 0,
            metadata: RoomMetadata {
                rule_set_id: "standard".to_string(),
                battle_record_id: None,
                private_room: false,
            },
        }
    }

    fn sample_entry(player: &str, session: &str) -> MatchmakingEntry {
        MatchmakingEntry {
            player_id: PlayerId::from(player),
            session_id: SessionId::from(session),
            rule_set_id: "standard".to_string(),
            join_time: epoch_ms(),
            player_data: serde_json::json!({"rating": 1000}),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_save_room_roundtrip_and_stamp() {
        let state = manager();
        let mut room = sample_room("r1", "node-a");
        state.save_room(&mut room).await.unwrap();
        assert!(room.last_active > 0);

        let loaded = state.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(loaded.instance_id.as_str(), "node-a");
        assert_eq!(loaded.sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_room_clears_reverse_indices() {
        let state = manager();
        let mut room = sample_room("r1", "node-a");
        for session in &room.sessions {
            state.set_session_room(session, &room.id).await.unwrap();
        }
        state.save_room(&mut room).await.unwrap();

        state.delete_room(&room.id).await.unwrap();
        assert!(state.get_room(&room.id).await.unwrap().is_none());
        for session in &room.sessions {
            assert!(state.get_session_room(session).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_rooms_on_instance_filters_by_owner() {
        let state = manager();
        state.save_room(&mut sample_room("r1", "node-a")).await.unwrap();
        state.save_room(&mut sample_room("r2", "node-b")).await.unwrap();
        state.save_room(&mut sample_room("r3", "node-a")).await.unwrap();

        let owned = state
            .rooms_on_instance(&InstanceId::from("node-a"))
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);
    }

    #[tokio::test]
    async fn test_opponent_lookup() {
        let room = sample_room("r1", "node-a");
        let opponent = room.opponent_of(&PlayerId::from("p1")).unwrap();
        assert_eq!(opponent.as_str(), "p2");
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_by_session_key() {
        let state = manager();
        let a = sample_entry("p1", "s1");
        let b = sample_entry("p2", "s2");
        state.enqueue(&a).await.unwrap();
        state.enqueue(&b).await.unwrap();

        assert!(state.is_queued("standard", &a.session_key()).await.unwrap());
        assert!(state.dequeue("standard", &a.session_key()).await.unwrap());
        assert!(!state.is_queued("standard", &a.session_key()).await.unwrap());

        let remaining = state.queue_entries("standard").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].player_id.as_str(), "p2");
    }

    #[tokio::test]
    async fn test_active_rule_sets_tracks_enqueues() {
        let state = manager();
        state.enqueue(&sample_entry("p1", "s1")).await.unwrap();
        let mut other = sample_entry("p2", "s2");
        other.rule_set_id = "blitz".to_string();
        state.enqueue(&other).await.unwrap();

        let mut rule_sets = state.active_rule_sets().await.unwrap();
        rule_sets.sort();
        assert_eq!(rule_sets, vec!["blitz", "standard"]);
    }

    #[tokio::test]
    async fn test_session_state_defaults_to_idle() {
        let state = manager();
        assert_eq!(
            state.get_session_state("p1:s1").await.unwrap(),
            SessionStateFlag::Idle
        );
        state
            .set_session_state("p1:s1", SessionStateFlag::Matchmaking)
            .await
            .unwrap();
        assert_eq!(
            state.get_session_state("p1:s1").await.unwrap(),
            SessionStateFlag::Matchmaking
        );
        state
            .set_session_state("p1:s1", SessionStateFlag::Idle)
            .await
            .unwrap();
        assert_eq!(
            state.get_session_state("p1:s1").await.unwrap(),
            SessionStateFlag::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_record_expires() {
        let state = manager();
        let player = PlayerId::from("p1");
        let connection = PlayerConnection {
            instance_id: InstanceId::from("node-a"),
            socket_id: "sock-1".to_string(),
            session_id: SessionId::from("s1"),
            last_seen: epoch_ms(),
            status: ConnectionStatus::Connected,
        };
        state.save_connection(&player, &connection).await.unwrap();
        assert!(state.is_connected("p1:s1").await.unwrap());

        tokio::time::advance(Duration::from_secs(180)).await;
        assert!(!state.is_connected("p1:s1").await.unwrap());
    }
}
