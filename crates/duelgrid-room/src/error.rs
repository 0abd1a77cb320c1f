//! Error type for the room layer.

use duelgrid_cluster::ClusterError;
use duelgrid_protocol::{ErrorCode, PlayerId, RoomId};

use crate::SimulationError;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// No room for the given id or session. Either the reverse index
    /// is stale or the battle already ended.
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// The acting player is not a combatant in the target room.
    #[error("player {player_id} does not belong to room {room_id}")]
    PlayerMismatch {
        room_id: RoomId,
        player_id: PlayerId,
    },

    /// The session's reverse index has no room behind it.
    #[error("session {0} has no active room")]
    NoActiveRoom(String),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    /// A remote instance answered the RPC with a failure.
    #[error("remote instance reported {code}: {message}")]
    Remote { code: ErrorCode, message: String },
}

impl RoomError {
    /// Maps onto the wire-level code carried in RPC responses.
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::Cluster(inner) => inner.code(),
            RoomError::NotFound(_) | RoomError::NoActiveRoom(_) => ErrorCode::RoomNotFound,
            RoomError::PlayerMismatch { .. } => ErrorCode::PlayerIdMismatch,
            RoomError::Simulation(SimulationError::InvalidSelection(_)) => {
                ErrorCode::InvalidSelection
            }
            RoomError::Simulation(_) => ErrorCode::Internal,
            RoomError::Remote { code, .. } => *code,
        }
    }
}
