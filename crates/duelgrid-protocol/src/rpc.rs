//! The inter-instance RPC surface.
//!
//! When an action arrives at an instance that does not own the target
//! room, the router serializes an [`RpcRequest`] and publishes it on the
//! owner's action channel; the owner replies on the caller's response
//! channel. Both sides correlate by request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorCode, InstanceId, PlayerId, RoomId};

/// The operation a remote instance is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcAction {
    SubmitPlayerSelection,
    GetAvailableSelection,
    GetBattleState,
    PlayerReady,
    PlayerAbandon,
    ReportAnimationEnd,
    StartAnimation,
    EndAnimation,
    IsTimerEnabled,
    GetPlayerTimerState,
    GetAllPlayerTimerStates,
    GetTimerConfig,
    TerminateBattle,
    CreateBattle,
}

impl RpcAction {
    /// Actions that are safe to answer with a neutral success when the
    /// target room turned out to be orphaned. Retrying or erroring would
    /// only confuse a client whose battle no longer exists.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::PlayerReady
                | Self::ReportAnimationEnd
                | Self::EndAnimation
                | Self::PlayerAbandon
        )
    }
}

/// A request forwarded to the instance that owns a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, unique per in-flight request.
    pub request_id: String,
    /// Which instance to answer on.
    pub reply_to: InstanceId,
    /// The operation to perform.
    pub action: RpcAction,
    /// Target room. Empty for `CreateBattle`.
    pub room_id: RoomId,
    /// Acting player.
    pub player_id: PlayerId,
    /// Action-specific payload.
    pub payload: Value,
}

/// The owner's answer to an [`RpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id copied from the request.
    pub request_id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error classification on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// Human-readable error detail on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RpcResponse {
    /// A successful response carrying `data`.
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    /// A failed response with a classified error.
    pub fn err(request_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(code),
            message: Some(message.into()),
        }
    }
}
