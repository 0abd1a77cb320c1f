//! The server-level error type.

use thiserror::Error;

use duelgrid_cluster::ClusterError;
use duelgrid_matchmaking::MatchmakingError;
use duelgrid_room::RoomError;

/// Anything a running instance can fail with. Each layer keeps its own
/// error type; this just unifies them at the public surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Matchmaking(#[from] MatchmakingError),

    #[error(transparent)]
    Room(#[from] RoomError),
}
