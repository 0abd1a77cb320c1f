//! Error type for matchmaking operations.

use duelgrid_cluster::{ClusterError, SessionStateFlag};

#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The session is already doing something that excludes queueing
    /// (in a battle, in a private room). Surfaced to the client as a
    /// rejection, nothing was mutated.
    #[error("session {session_key} cannot queue while in state {state:?}")]
    SessionStateConflict {
        session_key: String,
        state: SessionStateFlag,
    },

    /// The session asked to queue but has no live connection record.
    #[error("session {0} has no live connection")]
    SessionNotConnected(String),

    /// The room layer failed to materialize a room for a chosen pair.
    #[error("room creation failed: {0}")]
    RoomCreation(String),
}
