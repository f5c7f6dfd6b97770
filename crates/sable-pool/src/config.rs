//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use sable_core::error::{PoolError, PoolErrorKind};
use sable_core::{Error, Result};

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections created up front when the pool is built
    pub min_size: usize,
    /// Maximum number of live connections (idle + in use)
    pub max_size: usize,
    /// Maximum time a checkout may wait for a free connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime; `Duration::ZERO` means unbounded
    pub max_lifetime: Duration,
    /// Reset server-side session state when reusing an idle connection
    pub reset_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::ZERO,
            reset_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// Set the minimum pool size.
    pub fn min_size(mut self, n: usize) -> Self {
        self.min_size = n;
        self
    }

    /// Set the checkout timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime (`Duration::ZERO` = unbounded).
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Enable or disable session reset on checkout.
    pub fn reset_on_checkout(mut self, enabled: bool) -> Self {
        self.reset_on_checkout = enabled;
        self
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                message: "max_size must be at least 1".to_string(),
            }));
        }
        if self.min_size > self.max_size {
            return Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                message: format!(
                    "min_size ({}) exceeds max_size ({})",
                    self.min_size, self.max_size
                ),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = PoolConfig::new(5)
            .min_size(2)
            .acquire_timeout(Duration::from_secs(10))
            .max_lifetime(Duration::from_secs(600))
            .reset_on_checkout(false);

        assert_eq!(config.max_size, 5);
        assert_eq!(config.min_size, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.max_lifetime, Duration::from_secs(600));
        assert!(!config.reset_on_checkout);
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        assert!(PoolConfig::new(0).validate().is_err());
        assert!(PoolConfig::new(2).min_size(3).validate().is_err());
        assert!(PoolConfig::new(2).min_size(2).validate().is_ok());
    }
}
