//! Coordination store abstraction for Duelgrid.
//!
//! Every cluster component talks to a shared store offering string
//! get/set with TTL, atomic set-if-absent, lists, sets, counters, key
//! scans, and publish/subscribe. The [`CoordStore`] trait captures that
//! contract; [`MemoryStore`] is the reference implementation used by
//! tests and single-node deployments. A Redis-backed implementation can
//! slot in behind the same trait; the method set deliberately mirrors
//! the Redis command surface (SET PX NX, delete-if-equal, RPUSH/LRANGE,
//! SADD/SMEMBERS, INCR, SCAN, PUBLISH/SUBSCRIBE).
//!
//! The [`LockManager`] builds TTL-bounded mutual exclusion on top of the
//! store's atomic primitives.

#![allow(async_fn_in_trait)]

mod error;
pub mod keys;
mod lock;
mod memory;
mod store;

pub use error::{LockError, StoreError};
pub use lock::{LockGuard, LockManager, LockOptions};
pub use memory::MemoryStore;
pub use store::{CoordStore, Subscription};
