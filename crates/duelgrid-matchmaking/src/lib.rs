//! Matchmaking for Duelgrid.
//!
//! Each rule set has a FIFO queue in the coordination store and a
//! matching strategy. The elected leader sweeps queues, picks a pair,
//! re-verifies both sides under a pair-scoped lock, and hands the pair
//! to the room layer. Everything is built to tolerate a rare duplicate
//! leader: the pair lock plus the queued-and-connected re-check make a
//! double sweep a no-op.

#![allow(async_fn_in_trait)]

mod config;
mod error;
mod fifo;
mod rating;
mod service;
mod strategy;

pub use config::{MatchmakingConfig, RatingConfig};
pub use error::MatchmakingError;
pub use fifo::FifoStrategy;
pub use rating::RatingStrategy;
pub use service::{MatchmakingService, RoomCreator};
pub use strategy::MatchingStrategy;
