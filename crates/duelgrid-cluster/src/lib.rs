//! Cluster plumbing for Duelgrid.
//!
//! Everything that makes a fleet of instances behave like one service
//! lives here: the instance registry with TTL heartbeats, leader
//! election for the matchmaking role, the shared-state manager holding
//! rooms, queues, and connection records, point-to-point RPC between
//! instances, and the messenger that delivers client events to whatever
//! instance owns a session's socket.

#![allow(async_fn_in_trait)]

mod error;
mod instance;
mod leader;
mod messenger;
mod rpc;
mod state;

pub use error::ClusterError;
pub use instance::{
    epoch_ms, InstanceRegistry, InstanceStatus, RegistryConfig, ServiceInstance,
};
pub use leader::{HeartbeatProber, LeaderElector, ReachabilityProber};
pub use messenger::{ClusterMessenger, LocalDelivery, SessionMessage, SessionMessenger};
pub use rpc::{ActionHandler, RpcClient, RpcConfig, RpcServer};
pub use state::{
    ClusterStateManager, ConnectionStatus, MatchmakingEntry, PlayerConnection, RoomMetadata,
    RoomState, RoomStatus, SessionStateFlag, SpectatorRef,
};
