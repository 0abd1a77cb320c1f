//! Outbound message batching.
//!
//! Battle simulations emit bursts of small events. Sending each one as
//! its own frame floods slow clients, so events are coalesced per
//! recipient and flushed when any of three triggers fires: an
//! immediate-kind message (battle start/end, turn boundaries, forced
//! switches), the batch reaching its size cap, or a short debounce
//! timer expiring. A max-age ceiling bounds worst-case latency under
//! constant trickle. Timer snapshots are coalesced separately,
//! latest-wins per player, since only the newest reading matters.
//!
//! Delivery is at-most-once with no retry; a reconnecting client gets
//! a full state resync instead of a replay.

#![allow(async_fn_in_trait)]

mod batcher;

pub use batcher::{BatchSink, BatcherConfig, MessageBatcher, Recipient};
