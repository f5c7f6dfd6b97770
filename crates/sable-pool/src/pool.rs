//! The bounded connection pool.
//!
//! The pool tracks three independently synchronized resources: the idle
//! queue, the in-use id set, and an atomic permit counter equal to the
//! free capacity. Connection creation, pinging, and session reset all
//! happen outside the collection locks, so slow I/O never blocks
//! unrelated pool operations.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sable_core::error::{PoolError, PoolErrorKind};
use sable_core::{Error, Result};

use crate::config::PoolConfig;

/// Outcome of a liveness check on a pooled connection.
///
/// Ping failure is expected data during checkout, not an exceptional
/// condition, so it is modeled as a variant rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// The connection answered; it can be handed out.
    Alive,
    /// The connection is gone; it must be replaced.
    Dead,
}

/// A connection the pool can manage.
pub trait PoolableConnection: Send + 'static {
    /// Process-unique id, used for in-use tracking.
    fn id(&self) -> u64;

    /// Time since the connection was established.
    fn age(&self) -> Duration;

    /// Liveness check performed when reusing an idle connection.
    fn ping(&mut self) -> PingResult;

    /// Re-initialize server-side session state before reuse.
    fn reset(&mut self) -> Result<()>;

    /// Flag the connection as exclusively held by a caller.
    fn set_active(&mut self, active: bool);

    /// Close the connection (best effort, consumes no result).
    fn close(&mut self);
}

/// Builds new physical connections for a pool.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: PoolableConnection;

    /// Establish a brand-new connection.
    fn connect(&self) -> Result<Self::Connection>;
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle connections waiting for reuse
    pub idle: usize,
    /// Connections currently checked out
    pub in_use: usize,
}

impl PoolStats {
    /// Total live connections (idle + in use).
    pub fn total(&self) -> usize {
        self.idle + self.in_use
    }
}

type DrainedHook = Box<dyn Fn() + Send + Sync>;

/// Lock a mutex, tolerating poisoning from a panicked holder.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bounded pool of reusable connections for one configuration.
pub struct ConnectionPool<F: ConnectionFactory> {
    key: String,
    factory: F,
    config: PoolConfig,
    /// Free capacity; decremented optimistically before a connection is
    /// created or checked out, restored on failure and on release.
    permits: AtomicIsize,
    idle: Mutex<VecDeque<F::Connection>>,
    in_use: Mutex<HashSet<u64>>,
    draining: AtomicBool,
    waiters: Mutex<()>,
    available: Condvar,
    on_drained: Mutex<Option<DrainedHook>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool for `key` with the given factory and configuration.
    pub fn new(key: impl Into<String>, factory: F, config: PoolConfig) -> Self {
        let max = config.max_size as isize;
        Self {
            key: key.into(),
            factory,
            config,
            permits: AtomicIsize::new(max),
            idle: Mutex::new(VecDeque::new()),
            in_use: Mutex::new(HashSet::new()),
            draining: AtomicBool::new(false),
            waiters: Mutex::new(()),
            available: Condvar::new(),
            on_drained: Mutex::new(None),
        }
    }

    /// The normalized configuration identity this pool serves.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether the pool has been marked draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: lock(&self.idle).len(),
            in_use: lock(&self.in_use).len(),
        }
    }

    /// Total live connections (idle + in use).
    pub fn total(&self) -> usize {
        self.stats().total()
    }

    /// Register the hook invoked once a draining pool reaches zero
    /// connections. The pool manager uses this to drop its registry entry.
    pub fn set_drained_hook(&self, hook: DrainedHook) {
        *lock(&self.on_drained) = Some(hook);
    }

    /// Create idle connections up to the configured minimum size.
    pub fn warm_up(&self) -> Result<()> {
        while self.total() < self.config.min_size {
            if !self.try_acquire_permit() {
                break;
            }
            match self.factory.connect() {
                Ok(conn) => {
                    lock(&self.idle).push_back(conn);
                    self.release_permit();
                }
                Err(e) => {
                    self.release_permit();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Check out a connection, waiting up to the configured timeout.
    pub fn get(self: &Arc<Self>) -> Result<PooledConnection<F>> {
        self.get_timeout(self.config.acquire_timeout)
    }

    /// Check out a connection, waiting up to `timeout`.
    ///
    /// The wait is a retry loop around an atomic permit reservation: the
    /// remaining budget is recomputed on every pass, so spurious wakeups
    /// cannot extend the effective timeout.
    pub fn get_timeout(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection<F>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_draining() {
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Draining,
                    message: format!("pool '{}' is draining", self.key),
                }));
            }

            if self.try_acquire_permit() {
                match self.checkout() {
                    Ok(mut conn) => {
                        let id = conn.id();
                        if !lock(&self.in_use).insert(id) {
                            tracing::warn!(id, pool = %self.key, "connection already checked out");
                        }
                        conn.set_active(true);
                        tracing::trace!(id, pool = %self.key, "connection checked out");
                        return Ok(PooledConnection {
                            pool: Arc::clone(self),
                            conn: Some(conn),
                        });
                    }
                    Err(e) => {
                        // construction failed; the reserved permit goes
                        // back so capacity does not silently shrink
                        self.release_permit();
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::pool_timeout(format!(
                    "no connection available within {:?} (pool '{}', max {})",
                    timeout, self.key, self.config.max_size
                )));
            }

            let guard = lock(&self.waiters);
            if self.permits.load(Ordering::Acquire) > 0 {
                // a permit appeared between the failed reservation and
                // parking; retry immediately
                drop(guard);
                continue;
            }
            let _ = self.available.wait_timeout(guard, deadline - now);
        }
    }

    /// Take one permit if any is free.
    fn try_acquire_permit(&self) -> bool {
        if self.permits.fetch_sub(1, Ordering::AcqRel) > 0 {
            true
        } else {
            self.permits.fetch_add(1, Ordering::AcqRel);
            false
        }
    }

    /// Restore one permit and wake exactly one waiter.
    fn release_permit(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
        let _guard = lock(&self.waiters);
        self.available.notify_one();
    }

    /// Obtain a connection once a permit is held: reuse an idle one
    /// (pinging it, replacing it transparently if dead, resetting its
    /// session if configured) or build a fresh one.
    fn checkout(&self) -> Result<F::Connection> {
        let candidate = lock(&self.idle).pop_front();
        let Some(mut conn) = candidate else {
            tracing::debug!(pool = %self.key, "creating new connection");
            return self.factory.connect();
        };

        // liveness check and reset happen outside the idle lock
        match conn.ping() {
            PingResult::Alive => {
                if self.config.reset_on_checkout {
                    if let Err(e) = conn.reset() {
                        tracing::debug!(
                            id = conn.id(),
                            pool = %self.key,
                            error = %e,
                            "session reset failed; replacing connection"
                        );
                        conn.close();
                        return self.factory.connect();
                    }
                }
                Ok(conn)
            }
            PingResult::Dead => {
                tracing::debug!(
                    id = conn.id(),
                    pool = %self.key,
                    "idle connection failed ping; replacing"
                );
                conn.close();
                self.factory.connect()
            }
        }
    }

    /// Return a connection to service or close it (pool draining, or the
    /// connection outlived its configured lifetime).
    pub(crate) fn put_back(&self, mut conn: F::Connection) {
        let id = conn.id();
        lock(&self.in_use).remove(&id);
        conn.set_active(false);

        let expired =
            !self.config.max_lifetime.is_zero() && conn.age() > self.config.max_lifetime;
        if self.is_draining() || expired {
            tracing::debug!(id, pool = %self.key, expired, "closing returned connection");
            conn.close();
        } else {
            lock(&self.idle).push_back(conn);
        }

        self.release_permit();
        self.maybe_destroyed();
    }

    /// Drop a connection that suffered a fatal transport error. It is
    /// never recycled; the permit is restored and one waiter woken.
    pub(crate) fn forget(&self, mut conn: F::Connection) {
        let id = conn.id();
        lock(&self.in_use).remove(&id);
        tracing::debug!(id, pool = %self.key, "discarding connection after fatal error");
        conn.close();
        self.release_permit();
        self.maybe_destroyed();
    }

    /// Mark the pool draining: close every idle connection now; in-use
    /// connections are closed as their holders release them.
    pub fn clear(&self) {
        self.draining.store(true, Ordering::Release);
        tracing::debug!(pool = %self.key, "draining pool");

        let drained: Vec<F::Connection> = lock(&self.idle).drain(..).collect();
        for mut conn in drained {
            conn.close();
        }

        // wake parked waiters so they observe the draining state
        {
            let _guard = lock(&self.waiters);
            self.available.notify_all();
        }
        self.maybe_destroyed();
    }

    /// Fire the drained hook once a draining pool holds no connections.
    fn maybe_destroyed(&self) {
        if !self.is_draining() {
            return;
        }
        let empty = lock(&self.idle).is_empty() && lock(&self.in_use).is_empty();
        if empty {
            if let Some(hook) = lock(&self.on_drained).take() {
                tracing::debug!(pool = %self.key, "pool drained; destroying");
                hook();
            }
        }
    }
}

/// A connection checked out from a pool.
///
/// The guard returns the connection on drop, so every caller exit path
/// (success or failure) releases it. A connection that suffered a fatal
/// transport error must be removed with [`discard`](Self::discard)
/// instead of being allowed to drop back into the idle set.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Drop the connection without recycling it (fatal-error path).
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.forget(conn);
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    struct FakeConnection {
        id: u64,
        created_at: Instant,
        alive: bool,
        active: bool,
        resets: usize,
    }

    impl PoolableConnection for FakeConnection {
        fn id(&self) -> u64 {
            self.id
        }
        fn age(&self) -> Duration {
            self.created_at.elapsed()
        }
        fn ping(&mut self) -> PingResult {
            if self.alive {
                PingResult::Alive
            } else {
                PingResult::Dead
            }
        }
        fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }
        fn set_active(&mut self, active: bool) {
            self.active = active;
        }
        fn close(&mut self) {
            self.alive = false;
        }
    }

    struct FakeFactory;

    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        fn connect(&self) -> Result<Self::Connection> {
            Ok(FakeConnection {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                created_at: Instant::now(),
                alive: true,
                active: false,
                resets: 0,
            })
        }
    }

    fn pool(config: PoolConfig) -> Arc<ConnectionPool<FakeFactory>> {
        Arc::new(ConnectionPool::new("test", FakeFactory, config))
    }

    #[test]
    fn checkout_and_release_recycles() {
        let pool = pool(PoolConfig::new(2));
        let first_id;
        {
            let conn = pool.get().unwrap();
            first_id = conn.id();
            assert!(conn.active);
            assert_eq!(pool.stats().in_use, 1);
        }
        assert_eq!(pool.stats(), PoolStats { idle: 1, in_use: 0 });

        let again = pool.get().unwrap();
        assert_eq!(again.id(), first_id);
    }

    #[test]
    fn reset_runs_on_reuse_when_configured() {
        let pool = pool(PoolConfig::new(1).reset_on_checkout(true));
        drop(pool.get().unwrap());
        let conn = pool.get().unwrap();
        assert_eq!(conn.resets, 1);

        let pool = pool_no_reset();
        drop(pool.get().unwrap());
        let conn = pool.get().unwrap();
        assert_eq!(conn.resets, 0);
    }

    fn pool_no_reset() -> Arc<ConnectionPool<FakeFactory>> {
        pool(PoolConfig::new(1).reset_on_checkout(false))
    }

    #[test]
    fn dead_idle_connection_is_replaced() {
        let pool = pool(PoolConfig::new(1).reset_on_checkout(false));
        let dead_id;
        {
            let mut conn = pool.get().unwrap();
            dead_id = conn.id();
            conn.alive = false;
        }
        let conn = pool.get().unwrap();
        assert_ne!(conn.id(), dead_id);
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn expired_connection_closes_on_release() {
        let pool = pool(PoolConfig::new(1).max_lifetime(Duration::from_nanos(1)));
        {
            let conn = pool.get().unwrap();
            std::thread::sleep(Duration::from_millis(2));
            drop(conn);
        }
        assert_eq!(pool.stats(), PoolStats { idle: 0, in_use: 0 });
    }

    #[test]
    fn discard_does_not_recycle() {
        let pool = pool(PoolConfig::new(1));
        let conn = pool.get().unwrap();
        conn.discard();
        assert_eq!(pool.total(), 0);
        // capacity is restored
        assert!(pool.get().is_ok());
    }

    #[test]
    fn warm_up_fills_to_min_size() {
        let pool = pool(PoolConfig::new(5).min_size(3));
        pool.warm_up().unwrap();
        assert_eq!(pool.stats(), PoolStats { idle: 3, in_use: 0 });
    }

    #[test]
    fn draining_pool_rejects_checkout() {
        let pool = pool(PoolConfig::new(2));
        pool.clear();
        let err = pool.get_timeout(Duration::from_millis(10)).unwrap_err();
        match err {
            Error::Pool(p) => assert_eq!(p.kind, PoolErrorKind::Draining),
            other => panic!("expected pool error, got {other:?}"),
        }
    }
}
