//! Point-to-point RPC between instances over store pub/sub.
//!
//! Requests go out on the target's action channel; responses come back
//! on the caller's response channel, matched up by request id. There is
//! no connection state: if the target has no subscriber on its channel
//! (crashed, not yet started) the publish reaches zero listeners and
//! the caller fails fast with `InstanceUnavailable` instead of waiting
//! out the timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use duelgrid_protocol::{InstanceId, PlayerId, RoomId, RpcAction, RpcRequest, RpcResponse};
use duelgrid_store::{keys, CoordStore};

use crate::ClusterError;

/// Counter feeding unique request ids.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Handles RPC requests arriving at this instance.
pub trait ActionHandler: Send + Sync + 'static {
    fn handle(&self, request: RpcRequest) -> impl Future<Output = RpcResponse> + Send;
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a caller waits for a response before declaring the
    /// target unreachable.
    pub call_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(15),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

/// Issues calls to other instances and routes their responses back.
pub struct RpcClient<S> {
    store: Arc<S>,
    self_id: InstanceId,
    config: RpcConfig,
    pending: PendingMap,
}

impl<S> Clone for RpcClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            self_id: self.self_id.clone(),
            config: self.config.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<S: CoordStore> RpcClient<S> {
    pub fn new(store: Arc<S>, self_id: InstanceId, config: RpcConfig) -> Self {
        Self {
            store,
            self_id,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the response listener. Must be running before any call
    /// is issued, or responses will be dropped on the floor.
    pub async fn spawn_response_listener(&self) -> Result<JoinHandle<()>, ClusterError> {
        let mut subscription = self
            .store
            .subscribe(&keys::chan_instance_responses(&self.self_id))
            .await?;
        let pending = Arc::clone(&self.pending);
        Ok(tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let response: RpcResponse = match serde_json::from_str(&raw) {
                    Ok(r) => r,
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed rpc response");
                        continue;
                    }
                };
                let waiter = pending
                    .lock()
                    .expect("rpc pending map poisoned")
                    .remove(&response.request_id);
                match waiter {
                    // Send fails only if the caller timed out already.
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(
                            request_id = %response.request_id,
                            "late rpc response, caller gone"
                        );
                    }
                }
            }
        }))
    }

    /// Calls an action on another instance and waits for its response.
    pub async fn call(
        &self,
        target: &InstanceId,
        action: RpcAction,
        room_id: RoomId,
        player_id: PlayerId,
        payload: Value,
    ) -> Result<RpcResponse, ClusterError> {
        let request_id = format!(
            "{}:{}",
            self.self_id,
            NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
        );
        let request = RpcRequest {
            request_id: request_id.clone(),
            reply_to: self.self_id.clone(),
            action,
            room_id,
            player_id,
            payload,
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("rpc pending map poisoned")
            .insert(request_id.clone(), tx);

        let reached = self
            .store
            .publish(
                &keys::chan_instance_actions(target),
                &serde_json::to_string(&request)?,
            )
            .await?;
        if reached == 0 {
            self.forget(&request_id);
            return Err(ClusterError::InstanceUnavailable(target.to_string()));
        }

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Channel closed or timed out: either way the target never
            // answered in time.
            Ok(Err(_)) | Err(_) => {
                self.forget(&request_id);
                tracing::warn!(%target, ?action, "rpc call timed out");
                Err(ClusterError::InstanceUnavailable(target.to_string()))
            }
        }
    }

    fn forget(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("rpc pending map poisoned")
            .remove(request_id);
    }
}

/// Serves RPC requests addressed to this instance.
pub struct RpcServer<S, H> {
    store: Arc<S>,
    self_id: InstanceId,
    handler: Arc<H>,
}

impl<S: CoordStore, H: ActionHandler> RpcServer<S, H> {
    pub fn new(store: Arc<S>, self_id: InstanceId, handler: Arc<H>) -> Self {
        Self {
            store,
            self_id,
            handler,
        }
    }

    /// Starts listening for requests. Each request is handled in its
    /// own task so a slow action cannot stall the channel.
    pub async fn spawn(&self) -> Result<JoinHandle<()>, ClusterError> {
        let mut subscription = self
            .store
            .subscribe(&keys::chan_instance_actions(&self.self_id))
            .await?;
        let store = Arc::clone(&self.store);
        let handler = Arc::clone(&self.handler);
        Ok(tokio::spawn(async move {
            while let Some(raw) = subscription.recv().await {
                let request: RpcRequest = match serde_json::from_str(&raw) {
                    Ok(r) => r,
                    Err(error) => {
                        tracing::warn!(%error, "dropping malformed rpc request");
                        continue;
                    }
                };
                let store = Arc::clone(&store);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let reply_to = request.reply_to.clone();
                    let response = handler.handle(request).await;
                    let Ok(encoded) = serde_json::to_string(&response) else {
                        return;
                    };
                    if let Err(error) = store
                        .publish(&keys::chan_instance_responses(&reply_to), &encoded)
                        .await
                    {
                        tracing::warn!(%reply_to, %error, "failed to publish rpc response");
                    }
                });
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duelgrid_protocol::ErrorCode;
    use duelgrid_store::MemoryStore;

    struct EchoHandler;
    impl ActionHandler for EchoHandler {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            match request.action {
                RpcAction::GetBattleState => RpcResponse::ok(
                    request.request_id,
                    serde_json::json!({"room": request.room_id}),
                ),
                _ => RpcResponse::err(
                    request.request_id,
                    ErrorCode::InvalidSelection,
                    "unsupported in test",
                ),
            }
        }
    }

    async fn start_pair(
        store: &Arc<MemoryStore>,
    ) -> (RpcClient<MemoryStore>, Vec<JoinHandle<()>>) {
        let server = RpcServer::new(
            Arc::clone(store),
            InstanceId::from("node-b"),
            Arc::new(EchoHandler),
        );
        let server_task = server.spawn().await.unwrap();

        let client = RpcClient::new(
            Arc::clone(store),
            InstanceId::from("node-a"),
            RpcConfig::default(),
        );
        let listener_task = client.spawn_response_listener().await.unwrap();
        (client, vec![server_task, listener_task])
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let (client, tasks) = start_pair(&store).await;

        let response = client
            .call(
                &InstanceId::from("node-b"),
                RpcAction::GetBattleState,
                RoomId::from("r1"),
                PlayerId::from("p1"),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(
            response.data.unwrap(),
            serde_json::json!({"room": "r1"})
        );
        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_call_error_response_propagates() {
        let store = Arc::new(MemoryStore::new());
        let (client, tasks) = start_pair(&store).await;

        let response = client
            .call(
                &InstanceId::from("node-b"),
                RpcAction::SubmitPlayerSelection,
                RoomId::from("r1"),
                PlayerId::from("p1"),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorCode::InvalidSelection));
        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_call_to_missing_instance_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let client = RpcClient::new(
            Arc::clone(&store),
            InstanceId::from("node-a"),
            RpcConfig::default(),
        );
        let listener = client.spawn_response_listener().await.unwrap();

        let err = client
            .call(
                &InstanceId::from("node-gone"),
                RpcAction::PlayerReady,
                RoomId::from("r1"),
                PlayerId::from("p1"),
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InstanceUnavailable(_)));
        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let store = Arc::new(MemoryStore::new());
        // A subscriber exists but nothing ever responds.
        let _silent = store
            .subscribe(&keys::chan_instance_actions("node-b"))
            .await
            .unwrap();

        let client = RpcClient::new(
            Arc::clone(&store),
            InstanceId::from("node-a"),
            RpcConfig {
                call_timeout: Duration::from_secs(1),
            },
        );
        let listener = client.spawn_response_listener().await.unwrap();

        let err = client
            .call(
                &InstanceId::from("node-b"),
                RpcAction::PlayerReady,
                RoomId::from("r1"),
                PlayerId::from("p1"),
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InstanceUnavailable(_)));
        listener.abort();
    }
}
