//! Identity newtypes.
//!
//! Players, sessions, rooms, and instances are all identified by opaque
//! strings issued elsewhere (auth layer, socket layer, id generator).
//! Wrapping them keeps a `SessionId` from ever being passed where a
//! `RoomId` is expected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a player (stable across sessions).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

/// A unique identifier for one live connection of a player.
///
/// A player may hold several sessions over time (reconnects, multiple
/// devices); cluster state is keyed by (player, session) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// A unique identifier for a battle room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

/// A unique identifier for a service instance in the fleet.
///
/// Instance ids sort lexicographically; leader election walks them in
/// ascending order, so the ordering is part of the cluster contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

macro_rules! impl_string_id {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl $ty {
            /// Borrows the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_id!(PlayerId);
impl_string_id!(SessionId);
impl_string_id!(RoomId);
impl_string_id!(InstanceId);

/// The canonical `player:session` composite key.
///
/// Used everywhere a (player, session) pair indexes a map or a store
/// key: connection records, disconnect tracking, batch recipients, and
/// the pair-scoped matchmaking lock.
pub fn session_key(player_id: &PlayerId, session_id: &SessionId) -> String {
    format!("{}:{}", player_id, session_id)
}
