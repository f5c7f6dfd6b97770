//! Pool registry.
//!
//! A [`PoolManager`] maps configuration identity (a normalized key such
//! as `user@host:port/database`) to a shared [`ConnectionPool`]. Pools
//! are created lazily on first request and removed automatically once a
//! drained pool holds no connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use sable_core::Result;

use crate::config::PoolConfig;
use crate::pool::{ConnectionFactory, ConnectionPool, PooledConnection};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type PoolMap<F> = HashMap<String, Arc<ConnectionPool<F>>>;

/// Registry of connection pools keyed by configuration identity.
pub struct PoolManager<F: ConnectionFactory> {
    pools: Arc<Mutex<PoolMap<F>>>,
}

impl<F: ConnectionFactory> Default for PoolManager<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> Clone for PoolManager<F> {
    fn clone(&self) -> Self {
        Self {
            pools: Arc::clone(&self.pools),
        }
    }
}

impl<F: ConnectionFactory> PoolManager<F> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        lock(&self.pools).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.pools).is_empty()
    }

    /// Whether a pool exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.pools).contains_key(key)
    }

    /// Look up the pool for `key`, if one is registered.
    pub fn get(&self, key: &str) -> Option<Arc<ConnectionPool<F>>> {
        lock(&self.pools).get(key).cloned()
    }

    /// Fetch the pool for `key`, creating it with `init` on first use.
    ///
    /// A pool found mid-drain is left to finish tearing down and a fresh
    /// pool takes its registry slot. Minimum-size warm-up runs outside
    /// the registry lock; a warm-up failure is logged and the pool is
    /// kept, since connections can still be created on demand.
    pub fn get_or_create(
        &self,
        key: &str,
        init: impl FnOnce() -> (F, PoolConfig),
    ) -> Result<Arc<ConnectionPool<F>>> {
        let pool = {
            let mut pools = lock(&self.pools);
            if let Some(existing) = pools.get(key) {
                if !existing.is_draining() {
                    return Ok(Arc::clone(existing));
                }
                tracing::debug!(key, "replacing draining pool");
            }

            let (factory, config) = init();
            config.validate()?;
            let pool = Arc::new(ConnectionPool::new(key, factory, config));
            self.install_drained_hook(&pool);
            pools.insert(key.to_string(), Arc::clone(&pool));
            tracing::debug!(key, max_size = pool.config().max_size, "pool created");
            pool
        };

        if pool.config().min_size > 0 {
            if let Err(e) = pool.warm_up() {
                tracing::warn!(key, error = %e, "pool warm-up failed");
            }
        }
        Ok(pool)
    }

    /// Convenience: fetch or create the pool for `key` and check out a
    /// connection from it.
    pub fn get_connection(
        &self,
        key: &str,
        init: impl FnOnce() -> (F, PoolConfig),
    ) -> Result<PooledConnection<F>> {
        self.get_or_create(key, init)?.get()
    }

    /// Drain the pool for `key`, if any. The registry entry disappears
    /// once the last connection is gone.
    pub fn clear_pool(&self, key: &str) {
        let pool = lock(&self.pools).get(key).cloned();
        if let Some(pool) = pool {
            pool.clear();
        }
    }

    /// Drain every registered pool.
    pub fn clear_all(&self) {
        let pools: Vec<Arc<ConnectionPool<F>>> = lock(&self.pools).values().cloned().collect();
        for pool in pools {
            pool.clear();
        }
    }

    /// Wire the pool's drained hook to remove its registry entry. The
    /// hook holds weak references so a forgotten manager or pool never
    /// keeps the other alive, and it only removes the entry if the slot
    /// still holds this exact pool (a replacement may have been
    /// registered while the old pool drained).
    fn install_drained_hook(&self, pool: &Arc<ConnectionPool<F>>) {
        let pools = Arc::downgrade(&self.pools);
        let weak_pool: Weak<ConnectionPool<F>> = Arc::downgrade(pool);
        let key = pool.key().to_string();
        pool.set_drained_hook(Box::new(move || {
            let (Some(pools), Some(pool)) = (pools.upgrade(), weak_pool.upgrade()) else {
                return;
            };
            let mut pools = lock(&pools);
            if let Some(current) = pools.get(&key) {
                if Arc::ptr_eq(current, &pool) {
                    pools.remove(&key);
                    tracing::debug!(key, "drained pool removed from registry");
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PingResult, PoolableConnection};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    struct FakeConnection {
        id: u64,
        created_at: Instant,
    }

    impl PoolableConnection for FakeConnection {
        fn id(&self) -> u64 {
            self.id
        }
        fn age(&self) -> Duration {
            self.created_at.elapsed()
        }
        fn ping(&mut self) -> PingResult {
            PingResult::Alive
        }
        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
        fn set_active(&mut self, _active: bool) {}
        fn close(&mut self) {}
    }

    struct FakeFactory;

    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        fn connect(&self) -> Result<Self::Connection> {
            Ok(FakeConnection {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                created_at: Instant::now(),
            })
        }
    }

    fn init() -> (FakeFactory, PoolConfig) {
        (FakeFactory, PoolConfig::new(2))
    }

    #[test]
    fn same_key_returns_same_pool() {
        let manager: PoolManager<FakeFactory> = PoolManager::new();
        let a = manager.get_or_create("db1", init).unwrap();
        let b = manager.get_or_create("db1", init).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);

        let c = manager.get_or_create("db2", init).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let manager: PoolManager<FakeFactory> = PoolManager::new();
        let err = manager.get_or_create("bad", || (FakeFactory, PoolConfig::new(0)));
        assert!(err.is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn empty_drained_pool_leaves_registry() {
        let manager: PoolManager<FakeFactory> = PoolManager::new();
        manager.get_or_create("db", init).unwrap();
        assert!(manager.contains("db"));

        // no connections outstanding, so clearing removes it immediately
        manager.clear_pool("db");
        assert!(!manager.contains("db"));
    }

    #[test]
    fn drained_pool_lingers_until_last_release() {
        let manager: PoolManager<FakeFactory> = PoolManager::new();
        let pool = manager.get_or_create("db", init).unwrap();
        let held = pool.get().unwrap();

        manager.clear_pool("db");
        assert!(manager.contains("db"));

        drop(held);
        assert!(!manager.contains("db"));
    }

    #[test]
    fn draining_pool_is_replaced_on_next_request() {
        let manager: PoolManager<FakeFactory> = PoolManager::new();
        let old = manager.get_or_create("db", init).unwrap();
        let held = old.get().unwrap();
        old.clear();

        let fresh = manager.get_or_create("db", init).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!fresh.is_draining());

        // the old pool finishing its drain must not evict the new entry
        drop(held);
        assert!(manager.contains("db"));
    }
}
