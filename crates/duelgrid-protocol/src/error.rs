//! The wire-level error taxonomy.
//!
//! Each crate defines its own rich error enum; this is the flattened
//! classification that crosses instance boundaries in RPC responses and
//! reaches clients. Screaming-snake on the wire to match the client SDK.

use serde::{Deserialize, Serialize};

/// Classified failure causes, as seen across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A named lock could not be acquired within the retry budget.
    /// Safe to retry later.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// The room does not exist (stale reverse index or already ended).
    #[error("battle not found")]
    RoomNotFound,

    /// The instance owning the room is unreachable; orphan cleanup has
    /// been triggered.
    #[error("target instance unavailable")]
    TargetInstanceUnavailable,

    /// The selection payload failed validation against the room.
    #[error("invalid selection")]
    InvalidSelection,

    /// The acting player is not a participant of the room.
    #[error("player id mismatch")]
    PlayerIdMismatch,

    /// The session is already queued or inside a room.
    #[error("session state conflict")]
    SessionStateConflict,

    /// Anything else; details travel in the response message.
    #[error("internal error")]
    Internal,
}
