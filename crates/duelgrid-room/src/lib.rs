//! Room lifecycle and action routing for Duelgrid.
//!
//! A room is born when matchmaking picks a pair, lives on exactly one
//! instance (which runs the battle simulation), and dies on battle end,
//! abandonment, or owner crash. Every player action is routed through
//! [`RoomService::route_action`]: straight into the local simulation if
//! this instance owns the room, over RPC otherwise.
//!
//! The [`ReconnectionManager`] layers the disconnect grace window on
//! top: pause on drop, resume on return, forfeit on timeout.

#![allow(async_fn_in_trait)]

mod config;
mod error;
mod placement;
mod reconnect;
mod service;
mod simulation;

pub use config::RoomConfig;
pub use error::RoomError;
pub use placement::{LeastLoadedOwner, LocalOwner, OwnerSelector};
pub use reconnect::{
    GraceActions, NoPendingFlush, PendingFlush, ReconnectConfig, ReconnectionManager,
};
pub use service::RoomService;
pub use simulation::{BattleSimulation, SimulationError, SimulationFactory};
