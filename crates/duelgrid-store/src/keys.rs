//! Keyspace and channel layout shared by every component.
//!
//! All keys and channel names are built here so the layout can be read
//! in one place and no two components ever collide on a prefix.

use std::fmt::Display;

/// Guards the global matchmaking sweep. Only the leader takes it.
pub const LOCK_MATCHMAKING: &str = "matchmaking";

/// Guards leader election itself.
pub const LOCK_LEADER_ELECTION: &str = "matchmaking:leader:election";

/// Set of rule set ids that currently have live queues.
pub const ACTIVE_RULE_SETS: &str = "matchmaking:rulesets";

/// Prefix for instance registry keys, for scans.
pub const INSTANCE_PREFIX: &str = "instance:";

/// Prefix for room state keys, for scans.
pub const ROOM_PREFIX: &str = "room:";

/// Counter feeding room id allocation.
pub const ROOM_COUNTER: &str = "room:id:counter";

/// Every key under the lock namespace.
pub fn lock(name: &str) -> String {
    format!("lock:{name}")
}

/// Guards creation of a single room.
pub fn lock_room_create(room_id: impl Display) -> String {
    format!("room:create:{room_id}")
}

/// Guards pairing of two specific queue entries. Session keys are
/// sorted so both sweep orders contend on the same lock.
pub fn lock_match_pair(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("match:{first}:{second}")
}

/// Registry entry for one service instance.
pub fn instance(id: impl Display) -> String {
    format!("{INSTANCE_PREFIX}{id}")
}

/// Authoritative room state.
pub fn room(id: impl Display) -> String {
    format!("{ROOM_PREFIX}{id}")
}

/// Reverse index from a session key to the room holding it.
pub fn session_room(session_key: &str) -> String {
    format!("session:room:{session_key}")
}

/// Connection record for one player session.
pub fn player_connection(session_key: &str) -> String {
    format!("player:connection:{session_key}")
}

/// Coarse state flag for one player session (idle, queued, in battle).
pub fn session_state(session_key: &str) -> String {
    format!("session:state:{session_key}")
}

/// FIFO queue of matchmaking entries for one rule set.
pub fn queue(rule_set_id: &str) -> String {
    format!("matchmaking:queue:{rule_set_id}")
}

/// Channel an instance listens on for battle action requests.
pub fn chan_instance_actions(id: impl Display) -> String {
    format!("instance:{id}:battle-actions")
}

/// Channel an instance listens on for responses to its own requests.
pub fn chan_instance_responses(id: impl Display) -> String {
    format!("instance:{id}:responses")
}

/// Channel an instance listens on for messages addressed to sessions
/// it owns.
pub fn chan_instance_messages(id: impl Display) -> String {
    format!("instance:{id}:messages")
}

/// Channel an instance listens on for cleanup orders.
pub fn chan_instance_cleanup(id: impl Display) -> String {
    format!("instance:{id}:cleanup")
}

/// Broadcast channel announcing newly created battles.
pub const CHAN_BATTLE_CREATED: &str = "battle:created";

/// Broadcast channel announcing rooms torn down cluster-wide.
pub const CHAN_ROOM_CLEANUP: &str = "room:cleanup";

/// Broadcast channel nudging the leader to sweep queues early.
pub const CHAN_MATCHMAKING_EVENTS: &str = "matchmaking:events";

/// Per-room channel carrying spectator-facing updates.
pub fn chan_spectator(room_id: impl Display) -> String {
    format!("spectate:{room_id}")
}
