//! Shared types for the Duelgrid cluster.
//!
//! Everything that crosses an instance boundary lives here: identity
//! newtypes, battle messages, client-facing events, and the RPC
//! request/response surface. All of it is JSON-serializable because the
//! coordination store and the inter-instance channels carry JSON.
//!
//! # Key types
//!
//! - [`PlayerId`], [`SessionId`], [`RoomId`], [`InstanceId`]: identity
//! - [`BattleMessage`] / [`MessageKind`]: simulation output events
//! - [`ClientEvent`]: what actually reaches a connected client
//! - [`RpcRequest`] / [`RpcResponse`]: the inter-instance call surface

mod error;
mod event;
mod ids;
mod message;
mod rpc;

pub use error::ErrorCode;
pub use event::ClientEvent;
pub use ids::{InstanceId, PlayerId, RoomId, SessionId, session_key};
pub use message::{BattleMessage, MessageKind, TimerSnapshot};
pub use rpc::{RpcAction, RpcRequest, RpcResponse};
