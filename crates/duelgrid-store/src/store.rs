//! The `CoordStore` trait: what the cluster requires from its store.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::StoreError;

/// A live subscription to a pub/sub channel.
///
/// Messages are delivered at most once, in publish order for a single
/// publisher only. Dropping the subscription unsubscribes.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Wraps a receiver produced by a store backend.
    pub fn new(receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self { receiver }
    }

    /// Waits for the next message. Returns `None` once the publisher
    /// side of the channel is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, for draining in tests.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

/// The coordination store contract.
///
/// All methods are async and cancel-safe. Components are generic over
/// `S: CoordStore` rather than holding trait objects, following the
/// same pattern the room layer uses for game logic.
pub trait CoordStore: Send + Sync + 'static {
    /// Reads a string key. `None` if absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Writes a string key, optionally with a TTL.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomic set-if-absent with TTL. Returns `true` if the key was
    /// set, `false` if it already existed. This is the primitive locks
    /// are built on.
    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes a key. Returns `true` if it existed.
    fn del(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomic delete-if-value-matches. Returns `true` if deleted.
    /// Used for lock release so a holder never deletes a lock that
    /// expired and was re-acquired by someone else.
    fn del_if_eq(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Resets a key's TTL. Returns `false` if the key is absent.
    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomic TTL-reset-if-value-matches. Used for lock extension.
    fn expire_if_eq(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomically increments an integer key, creating it at 0 first.
    fn incr(&self, key: &str) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Appends to a list key. Returns the new length.
    fn list_push(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Reads a whole list in insertion order.
    fn list_all(&self, key: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Removes every occurrence of `value` from a list. Returns how
    /// many were removed.
    fn list_remove(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Adds a member to a set. Returns `true` if newly added.
    fn set_add(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Removes a member from a set. Returns `true` if it was present.
    fn set_remove(
        &self,
        key: &str,
        member: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Lists all members of a set.
    fn set_members(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Lists all live keys starting with `prefix`.
    ///
    /// Consumers must tolerate staleness: a key may expire between the
    /// scan and a follow-up read.
    fn scan(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Publishes a payload on a channel. Returns the number of
    /// subscribers it reached (at-most-once, no retry).
    fn publish(
        &self,
        channel: &str,
        payload: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Opens a subscription on a channel.
    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send;
}
