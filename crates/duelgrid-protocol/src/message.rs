//! Battle messages: the events the simulation emits toward clients.
//!
//! The payload of each message is opaque JSON from the simulation's
//! point of view; only the [`MessageKind`] matters to the cluster layer,
//! because it decides batching behavior (state-defining kinds flush
//! immediately, everything else coalesces).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PlayerId;

/// The kind of a battle message.
///
/// The cluster does not interpret battle semantics; it only needs to
/// distinguish state-defining events (which must never sit in a batch)
/// from the high-frequency stream of ordinary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Battle started. State-defining: flushes immediately.
    BattleStart,
    /// Battle ended. State-defining: flushes immediately.
    BattleEnd,
    /// A new turn began. State-defining: flushes immediately.
    TurnStart,
    /// A turn finished resolving. State-defining: flushes immediately.
    TurnEnd,
    /// The player must pick a replacement now. State-defining.
    ForcedSwitch,
    /// An ordinary battle event (damage, heal, status, animation cue).
    BattleEvent,
    /// A timer tick or adjustment event.
    TimerEvent,
}

impl MessageKind {
    /// Whether this kind must bypass batching and deliver synchronously.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Self::BattleStart
                | Self::BattleEnd
                | Self::TurnStart
                | Self::TurnEnd
                | Self::ForcedSwitch
        )
    }
}

/// One message from the battle simulation to a recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleMessage {
    /// Message kind; drives batching decisions.
    pub kind: MessageKind,
    /// Opaque payload produced by the simulation.
    pub payload: Value,
}

impl BattleMessage {
    /// Builds a message of the given kind.
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

/// A point-in-time view of one player's battle timer.
///
/// Snapshots are merged latest-wins per player when batched, so a burst
/// of snapshots collapses to one per player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    /// Whose timer this describes.
    pub player_id: PlayerId,
    /// Remaining turn time in milliseconds.
    pub remaining_turn_ms: u64,
    /// Remaining total time in milliseconds.
    pub remaining_total_ms: u64,
    /// Whether the timer is currently counting down.
    pub running: bool,
}
