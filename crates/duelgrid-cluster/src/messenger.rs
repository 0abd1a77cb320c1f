//! Delivers client events to whichever instance owns a session.
//!
//! A client can be connected to any instance, so sending "your opponent
//! disconnected" means looking up the session's connection record and
//! either handing the event to the local transport or publishing it on
//! the owning instance's message channel. Delivery is at-most-once; a
//! reconnecting client gets a full state resync instead of a replay.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use duelgrid_protocol::{session_key, ClientEvent, PlayerId, SessionId};
use duelgrid_store::{keys, CoordStore};

use crate::{ClusterError, ClusterStateManager};

/// Anything that can push an event toward a player session.
pub trait SessionMessenger: Send + Sync {
    fn send_to_session(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        event: ClientEvent,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

/// The local transport seam. The server wires its socket registry in
/// here; tests wire in a channel.
pub trait LocalDelivery: Send + Sync + 'static {
    /// Delivers to a locally connected session. Returns `false` if the
    /// session has no local socket.
    fn deliver_local(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        event: ClientEvent,
    ) -> impl Future<Output = bool> + Send;
}

/// Envelope published on an instance's message channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub player_id: PlayerId,
    pub session_id: SessionId,
    pub event: ClientEvent,
}

/// Routes events by connection record: local socket or remote publish.
pub struct ClusterMessenger<S, L> {
    state: ClusterStateManager<S>,
    self_id: duelgrid_protocol::InstanceId,
    local: Arc<L>,
}

impl<S, L> Clone for ClusterMessenger<S, L> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            self_id: self.self_id.clone(),
            local: Arc::clone(&self.local),
        }
    }
}

impl<S: CoordStore, L: LocalDelivery> ClusterMessenger<S, L> {
    pub fn new(
        state: ClusterStateManager<S>,
        self_id: duelgrid_protocol::InstanceId,
        local: Arc<L>,
    ) -> Self {
        Self {
            state,
            self_id,
            local,
        }
    }

    /// Starts consuming the local instance's message channel, handing
    /// forwarded events to the local transport.
    pub async fn spawn_message_listener(&self) -> Result<JoinHandle<()>, ClusterError> {
        let mut subscription = self
            .state
            .store()
            .subscribe(&keys::chan_instance_messages(&self.self_id))
            .await?;
        let local = Arc::clone(&self.local);
        Ok(tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let message: SessionMessage = match serde_json::from_str(&raw) {
                    Ok(m) => m,
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed session message");
                        continue;
                    }
                };
                let delivered = local
                    .deliver_local(&message.player_id, &message.session_id, message.event)
                    .await;
                if !delivered {
                    // The session moved or dropped since the publisher
                    // read its connection record. At-most-once, so drop.
                    tracing::debug!(
                        player_id = %message.player_id,
                        "forwarded event had no local session"
                    );
                }
            }
        }))
    }
}

impl<S: CoordStore, L: LocalDelivery> SessionMessenger for ClusterMessenger<S, L> {
    async fn send_to_session(
        &self,
        player_id: &PlayerId,
        session_id: &SessionId,
        event: ClientEvent,
    ) -> Result<(), ClusterError> {
        // Fast path: the session is on this instance.
        if self
            .local
            .deliver_local(player_id, session_id, event.clone())
            .await
        {
            return Ok(());
        }

        let key = session_key(player_id, session_id);
        let Some(connection) = self.state.get_connection(&key).await? else {
            tracing::debug!(session_key = %key, "no connection record, dropping event");
            return Ok(());
        };
        if connection.instance_id == self.self_id {
            // Record says local but the socket is gone. Drop.
            return Ok(());
        }

        let envelope = SessionMessage {
            player_id: player_id.clone(),
            session_id: session_id.clone(),
            event,
        };
        self.state
            .store()
            .publish(
                &keys::chan_instance_messages(&connection.instance_id),
                &serde_json::to_string(&envelope)?,
            )
            .await?;
        Ok(())
    }
}
