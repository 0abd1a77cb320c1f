//! Distributed locks over the coordination store.
//!
//! A lock is a store key under `lock:` holding a random token with a
//! TTL. Acquisition is atomic set-if-absent; release and extension
//! compare the token first, so a holder whose lock expired and was
//! re-acquired elsewhere can never stomp the new holder.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::{keys, CoordStore, LockError, StoreError};

/// Tuning for a single acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long the lock lives if the holder dies without releasing.
    pub ttl: Duration,
    /// How many times to retry after the initial attempt fails.
    pub retry_count: u32,
    /// Pause between retries.
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 10,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Proof of lock ownership. Holds the token needed to release or
/// extend. Dropping the guard does NOT release the lock; call
/// [`LockManager::release`] or let the TTL reap it.
#[derive(Debug, Clone)]
pub struct LockGuard {
    key: String,
    token: String,
    ttl: Duration,
}

impl LockGuard {
    /// The full store key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Acquires and manages TTL-bounded locks.
pub struct LockManager<S> {
    store: Arc<S>,
}

impl<S> Clone for LockManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CoordStore> LockManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Tries to take the named lock, retrying per `options`.
    pub async fn acquire(&self, name: &str, options: &LockOptions) -> Result<LockGuard, LockError> {
        let key = keys::lock(name);
        let token = generate_token();
        let attempts = options.retry_count + 1;

        for attempt in 0..attempts {
            if self.store.set_nx(&key, &token, options.ttl).await? {
                tracing::debug!(%key, attempt, "lock acquired");
                return Ok(LockGuard {
                    key,
                    token,
                    ttl: options.ttl,
                });
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        tracing::warn!(%key, attempts, "lock acquisition timed out");
        Err(LockError::Timeout { key, attempts })
    }

    /// Releases a held lock. Returns `false` if the lock had already
    /// expired and possibly been taken by someone else.
    pub async fn release(&self, guard: &LockGuard) -> Result<bool, StoreError> {
        let released = self.store.del_if_eq(&guard.key, &guard.token).await?;
        if !released {
            tracing::warn!(key = %guard.key, "lock expired before release");
        }
        Ok(released)
    }

    /// Pushes the TTL back out to its original length. Returns `false`
    /// if ownership was lost, in which case the caller must stop
    /// assuming exclusivity.
    pub async fn extend(&self, guard: &LockGuard) -> Result<bool, StoreError> {
        self.store
            .expire_if_eq(&guard.key, &guard.token, guard.ttl)
            .await
    }

    /// Whether the guard still owns its lock.
    pub async fn is_valid(&self, guard: &LockGuard) -> Result<bool, StoreError> {
        Ok(self.store.get(&guard.key).await?.as_deref() == Some(guard.token.as_str()))
    }

    /// Runs `f` while holding the named lock with default options.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.with_lock_opts(name, &LockOptions::default(), f).await
    }

    /// Runs `f` while holding the named lock. The lock is released on
    /// both normal return and if `f` panics the TTL cleans up.
    pub async fn with_lock_opts<F, Fut, T>(
        &self,
        name: &str,
        options: &LockOptions,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire(name, options).await?;
        let out = f().await;
        self.release(&guard).await?;
        Ok(out)
    }
}

fn generate_token() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn manager() -> LockManager<MemoryStore> {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    fn no_retry() -> LockOptions {
        LockOptions {
            retry_count: 0,
            ..LockOptions::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_release_acquire_again() {
        let locks = manager();
        let guard = locks.acquire("sweep", &no_retry()).await.unwrap();
        assert!(locks.release(&guard).await.unwrap());
        locks.acquire("sweep", &no_retry()).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_held_lock_times_out() {
        let locks = manager();
        let _held = locks.acquire("sweep", &no_retry()).await.unwrap();
        let err = locks.acquire("sweep", &no_retry()).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_once_holder_expires() {
        let locks = manager();
        let opts = LockOptions {
            ttl: Duration::from_millis(300),
            retry_count: 5,
            retry_delay: Duration::from_millis(100),
        };
        let _held = locks.acquire("sweep", &opts).await.unwrap();
        // Retries outlive the holder's TTL, so the second caller wins.
        locks.acquire("sweep", &opts).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expiry_reports_loss() {
        let locks = manager();
        let opts = LockOptions {
            ttl: Duration::from_millis(100),
            ..no_retry()
        };
        let guard = locks.acquire("sweep", &opts).await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!locks.release(&guard).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lock_alive() {
        let locks = manager();
        let opts = LockOptions {
            ttl: Duration::from_millis(500),
            ..no_retry()
        };
        let guard = locks.acquire("sweep", &opts).await.unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(locks.extend(&guard).await.unwrap());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(locks.is_valid(&guard).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lost_lock_fails() {
        let locks = manager();
        let opts = LockOptions {
            ttl: Duration::from_millis(100),
            ..no_retry()
        };
        let guard = locks.acquire("sweep", &opts).await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        let _stolen = locks.acquire("sweep", &opts).await.unwrap();
        assert!(!locks.extend(&guard).await.unwrap());
        assert!(!locks.is_valid(&guard).await.unwrap());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_body() {
        let locks = manager();
        let out = locks.with_lock("sweep", || async { 7 }).await.unwrap();
        assert_eq!(out, 7);
        locks.acquire("sweep", &no_retry()).await.unwrap();
    }
}
