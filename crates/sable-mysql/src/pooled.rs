//! Pool integration.
//!
//! Glue between [`Driver`] and the generic pool in `sable-pool`:
//! a [`DriverFactory`] builds drivers from a [`DriverConfig`], and the
//! [`PoolableConnection`] impl lets the pool ping, reset, and close them.

use sable_core::Result;
use sable_pool::{
    ConnectionFactory, ConnectionPool, PingResult, PoolConfig, PoolManager, PoolableConnection,
    PooledConnection,
};

use crate::config::DriverConfig;
use crate::driver::Driver;

/// Builds [`Driver`]s for one connection configuration.
pub struct DriverFactory {
    config: DriverConfig,
}

impl DriverFactory {
    /// Create a factory for `config`.
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    /// The connection configuration this factory builds from.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
}

impl ConnectionFactory for DriverFactory {
    type Connection = Driver;

    fn connect(&self) -> Result<Driver> {
        Driver::connect(&self.config)
    }
}

impl PoolableConnection for Driver {
    fn id(&self) -> u64 {
        Driver::id(self)
    }

    fn age(&self) -> std::time::Duration {
        Driver::age(self)
    }

    fn ping(&mut self) -> PingResult {
        Driver::ping(self)
    }

    fn reset(&mut self) -> Result<()> {
        self.reset_session()
    }

    fn set_active(&mut self, active: bool) {
        self.set_busy(active);
    }

    fn close(&mut self) {
        Driver::close(self);
    }
}

/// A pool of MySQL drivers.
pub type DriverPool = ConnectionPool<DriverFactory>;

/// A checked-out MySQL driver.
pub type PooledDriver = PooledConnection<DriverFactory>;

/// The registry of MySQL driver pools.
pub type DriverPoolManager = PoolManager<DriverFactory>;

/// Check out a driver for `config` from `manager`, creating the pool on
/// first use. The pool is keyed by [`DriverConfig::connection_key`].
pub fn get_driver(
    manager: &DriverPoolManager,
    config: &DriverConfig,
    pool_config: PoolConfig,
) -> Result<PooledDriver> {
    manager.get_connection(&config.connection_key(), || {
        (DriverFactory::new(config.clone()), pool_config)
    })
}
