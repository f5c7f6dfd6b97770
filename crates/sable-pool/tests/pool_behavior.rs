//! Concurrency behavior of the pool and registry: capacity bounds,
//! exclusive checkout, timeout, draining, and stale-connection
//! replacement, exercised with a fake connection factory and real
//! threads.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sable_core::error::PoolErrorKind;
use sable_core::{Error, Result};
use sable_pool::{
    ConnectionFactory, ConnectionPool, PingResult, PoolConfig, PoolManager, PoolableConnection,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared observations across all connections a factory creates.
#[derive(Default)]
struct Telemetry {
    live: AtomicUsize,
    peak_live: AtomicUsize,
    double_checkout: AtomicBool,
    /// Connections whose next ping should fail.
    dead: Mutex<Vec<u64>>,
}

impl Telemetry {
    fn mark_dead(&self, id: u64) {
        self.dead.lock().unwrap().push(id);
    }

    fn is_dead(&self, id: u64) -> bool {
        self.dead.lock().unwrap().contains(&id)
    }
}

struct FakeConnection {
    id: u64,
    created_at: Instant,
    active: bool,
    telemetry: Arc<Telemetry>,
}

impl PoolableConnection for FakeConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn ping(&mut self) -> PingResult {
        if self.telemetry.is_dead(self.id) {
            PingResult::Dead
        } else {
            PingResult::Alive
        }
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_active(&mut self, active: bool) {
        if active && self.active {
            self.telemetry.double_checkout.store(true, Ordering::SeqCst);
        }
        self.active = active;
    }

    fn close(&mut self) {
        self.telemetry.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeFactory {
    telemetry: Arc<Telemetry>,
}

impl FakeFactory {
    fn new(telemetry: Arc<Telemetry>) -> Self {
        Self { telemetry }
    }
}

impl ConnectionFactory for FakeFactory {
    type Connection = FakeConnection;

    fn connect(&self) -> Result<FakeConnection> {
        let live = self.telemetry.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.telemetry.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(FakeConnection {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            created_at: Instant::now(),
            active: false,
            telemetry: Arc::clone(&self.telemetry),
        })
    }
}

fn pool_with(
    config: PoolConfig,
) -> (Arc<ConnectionPool<FakeFactory>>, Arc<Telemetry>) {
    let telemetry = Arc::new(Telemetry::default());
    let pool = Arc::new(ConnectionPool::new(
        "test",
        FakeFactory::new(Arc::clone(&telemetry)),
        config,
    ));
    (pool, telemetry)
}

#[test]
fn capacity_never_exceeded_under_contention() {
    const MAX: usize = 4;
    const THREADS: usize = 16;
    const ITERATIONS: usize = 50;

    let (pool, telemetry) = pool_with(PoolConfig::new(MAX));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let conn = pool.get_timeout(Duration::from_secs(10)).unwrap();
                    thread::yield_now();
                    drop(conn);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(
        telemetry.peak_live.load(Ordering::SeqCst) <= MAX,
        "live connections exceeded max_size"
    );
    assert!(!telemetry.double_checkout.load(Ordering::SeqCst));
    assert_eq!(pool.stats().in_use, 0);
    assert!(pool.total() <= MAX);
}

#[test]
fn no_double_checkout_of_one_connection() {
    let (pool, telemetry) = pool_with(PoolConfig::new(1));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..25 {
                    let conn = pool.get_timeout(Duration::from_secs(10)).unwrap();
                    assert!(conn.id() > 0);
                    drop(conn);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(!telemetry.double_checkout.load(Ordering::SeqCst));
}

#[test]
fn exhausted_pool_times_out_after_the_budget() {
    let (pool, _telemetry) = pool_with(PoolConfig::new(1));
    let held = pool.get().unwrap();

    let started = Instant::now();
    let err = pool.get_timeout(Duration::from_millis(200)).unwrap_err();
    let elapsed = started.elapsed();

    match err {
        Error::Pool(p) => assert_eq!(p.kind, PoolErrorKind::Timeout),
        other => panic!("expected pool timeout, got {other:?}"),
    }
    assert!(
        elapsed >= Duration::from_millis(150),
        "failed too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "failed too late: {elapsed:?}"
    );
    drop(held);
}

#[test]
fn waiter_wakes_when_a_connection_is_released() {
    let (pool, _telemetry) = pool_with(PoolConfig::new(1));
    let held = pool.get().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.get_timeout(Duration::from_secs(5)).map(|c| c.id()))
    };

    thread::sleep(Duration::from_millis(50));
    let held_id = held.id();
    drop(held);

    let got = waiter.join().unwrap().unwrap();
    assert_eq!(got, held_id, "waiter should receive the recycled connection");
}

#[test]
fn draining_removes_pool_after_last_release() {
    let telemetry = Arc::new(Telemetry::default());
    let manager: PoolManager<FakeFactory> = PoolManager::new();
    let init = {
        let telemetry = Arc::clone(&telemetry);
        move || (FakeFactory::new(telemetry), PoolConfig::new(3))
    };

    let pool = manager.get_or_create("db", init).unwrap();
    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    let c = pool.get().unwrap();

    manager.clear_pool("db");
    assert!(manager.contains("db"), "in-use connections keep the entry");

    drop(a);
    drop(b);
    assert!(manager.contains("db"));

    drop(c);
    assert!(!manager.contains("db"), "drained pool must leave the registry");
    assert_eq!(telemetry.live.load(Ordering::SeqCst), 0, "no lingering connections");
}

#[test]
fn dead_idle_connection_is_replaced_transparently() {
    let (pool, telemetry) = pool_with(PoolConfig::new(2).reset_on_checkout(false));

    let stale_id = {
        let conn = pool.get().unwrap();
        conn.id()
    };
    telemetry.mark_dead(stale_id);

    let conn = pool.get().unwrap();
    assert_ne!(conn.id(), stale_id, "dead connection must not be handed out");
    assert_eq!(telemetry.live.load(Ordering::SeqCst), 1);
}

#[test]
fn construction_failure_restores_capacity() {
    struct FlakyFactory {
        fail_next: AtomicBool,
        telemetry: Arc<Telemetry>,
    }

    impl ConnectionFactory for FlakyFactory {
        type Connection = FakeConnection;

        fn connect(&self) -> Result<FakeConnection> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::connect("backend unreachable"));
            }
            self.telemetry.live.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
                created_at: Instant::now(),
                active: false,
                telemetry: Arc::clone(&self.telemetry),
            })
        }
    }

    let telemetry = Arc::new(Telemetry::default());
    let pool = Arc::new(ConnectionPool::new(
        "flaky",
        FlakyFactory {
            fail_next: AtomicBool::new(true),
            telemetry: Arc::clone(&telemetry),
        },
        PoolConfig::new(1),
    ));

    // first attempt fails while holding the only permit
    assert!(pool.get_timeout(Duration::from_millis(100)).is_err());
    // the permit must have been restored, so the retry succeeds
    let conn = pool.get_timeout(Duration::from_millis(100)).unwrap();
    assert!(conn.id() > 0);
}
