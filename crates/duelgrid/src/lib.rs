//! # Duelgrid
//!
//! Distributed coordination for two-party battles.
//!
//! A fleet of instances shares a coordination store and behaves like
//! one service: any instance can accept a client session, matchmaking
//! runs on an elected leader, each battle lives on exactly one
//! instance, and player actions are routed to it over store-backed
//! RPC. Disconnected combatants get a grace window before forfeiting,
//! and outbound battle events are batched per recipient.
//!
//! The transport layer is not included. A host embeds the server,
//! implements [`LocalDelivery`](duelgrid_cluster::LocalDelivery) over
//! its sockets, and feeds sessions and actions in.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use duelgrid::prelude::*;
//!
//! // Implement SimulationFactory and LocalDelivery, then:
//! // let server = BattleServer::builder()
//! //     .instance_id("instance-1")
//! //     .strategy("ranked", Arc::new(RatingStrategy::new(RatingConfig::default(), 30_000)))
//! //     .start(store, transport, factory)
//! //     .await?;
//! ```

mod delivery;
mod error;
mod server;
mod telemetry;

pub use delivery::{BatchFlush, EventSink, RoomSpawner};
pub use error::ServerError;
pub use server::{BattleServer, BattleServerBuilder, ServerConfig};
pub use telemetry::init_tracing;

/// The types a host embedding the server usually needs.
pub mod prelude {
    pub use std::sync::Arc;

    pub use duelgrid_batch::{BatcherConfig, Recipient};
    pub use duelgrid_cluster::{LocalDelivery, MatchmakingEntry};
    pub use duelgrid_matchmaking::{
        FifoStrategy, MatchingStrategy, MatchmakingConfig, RatingConfig, RatingStrategy,
    };
    pub use duelgrid_protocol::{
        BattleMessage, ClientEvent, InstanceId, MessageKind, PlayerId, RoomId, RpcAction,
        SessionId, TimerSnapshot,
    };
    pub use duelgrid_room::{
        BattleSimulation, ReconnectConfig, RoomConfig, SimulationError, SimulationFactory,
    };
    pub use duelgrid_store::{CoordStore, MemoryStore};

    pub use crate::{BattleServer, BattleServerBuilder, ServerConfig, ServerError};
}
