//! Connection pooling for Sable.
//!
//! This crate bounds the number of live connections per configuration and
//! arbitrates concurrent reuse:
//!
//! - [`ConnectionPool`]: a bounded pool with wait-with-timeout checkout,
//!   liveness validation, session reset, lifetime eviction, and draining
//! - [`PooledConnection`]: a scoped guard that returns the connection on
//!   every exit path
//! - [`PoolManager`]: an explicit registry mapping configuration identity
//!   to pool, created lazily and torn down once a drained pool is empty
//!
//! The pool is generic over a [`ConnectionFactory`], so it can be driven
//! by any connection type (and exercised in tests without a server).

pub mod config;
pub mod manager;
pub mod pool;

pub use config::PoolConfig;
pub use manager::PoolManager;
pub use pool::{
    ConnectionFactory, ConnectionPool, PingResult, PoolStats, PoolableConnection,
    PooledConnection,
};
