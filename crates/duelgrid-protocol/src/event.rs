//! Client-facing events.
//!
//! These are delivered to a connected session through the message
//! batcher. The JSON shape is internally tagged so the client SDK can
//! switch on `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BattleMessage, PlayerId, RoomId, TimerSnapshot};

/// An event delivered to a client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// A single battle message.
    #[serde(rename = "battleEvent")]
    BattleEvent { message: BattleMessage },

    /// An ordered batch of coalesced battle messages.
    #[serde(rename = "battleEventBatch")]
    BattleEventBatch { messages: Vec<BattleMessage> },

    /// Matchmaking succeeded; the client should join the room.
    #[serde(rename = "matchSuccess")]
    MatchSuccess {
        room_id: RoomId,
        opponent_id: PlayerId,
    },

    /// The opponent's transport dropped; their grace window is running.
    #[serde(rename = "opponentDisconnected")]
    OpponentDisconnected {
        player_id: PlayerId,
        grace_remaining_ms: u64,
    },

    /// The opponent reconnected inside the grace window.
    #[serde(rename = "opponentReconnected")]
    OpponentReconnected { player_id: PlayerId },

    /// The room was closed (battle over, abandonment, crash cleanup).
    #[serde(rename = "roomClosed")]
    RoomClosed { room_id: RoomId, reason: String },

    /// Coalesced timer snapshots, latest-wins per player.
    #[serde(rename = "timerSnapshot")]
    TimerSnapshot { snapshots: Vec<TimerSnapshot> },

    /// A full battle-state resync (sent on reconnect).
    #[serde(rename = "battleState")]
    BattleState { room_id: RoomId, state: Value },
}
