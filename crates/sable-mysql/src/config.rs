//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{MAX_BLOCK_SIZE, capabilities, charset};

/// Configuration for one backend connection.
///
/// [`connection_key`](Self::connection_key) produces the normalized
/// identity the pool manager keys its registry by: two configurations
/// with the same key share a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database name to select at connect time
    pub database: Option<String>,
    /// Session character set (default: utf8mb4)
    pub charset: u8,
    /// TCP connect and handshake timeout
    pub connect_timeout: Duration,
    /// Request the compressed protocol (CLIENT_COMPRESS)
    pub compression: bool,
    /// Max allowed packet size announced to the server (default: 64MB)
    pub max_packet_size: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            compression: false,
            max_packet_size: 64 * 1024 * 1024,
        }
    }
}

impl DriverConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the session character set.
    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable the compressed protocol.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Set the max allowed packet size.
    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Socket address string for the TCP connect.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Normalized identity for pool lookup.
    ///
    /// Includes everything that changes the server-side session a
    /// connection would have; the password is deliberately excluded.
    pub fn connection_key(&self) -> String {
        format!(
            "{}@{}:{}/{}?compress={}",
            self.user,
            self.host,
            self.port,
            self.database.as_deref().unwrap_or(""),
            self.compression,
        )
    }

    /// Per-packet payload cap for the transport.
    pub fn max_block_size(&self) -> usize {
        MAX_BLOCK_SIZE.min(self.max_packet_size as usize)
    }

    /// Client capability flags derived from this configuration.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.compression {
            flags |= capabilities::CLIENT_COMPRESS;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = DriverConfig::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .connect_timeout(Duration::from_secs(10))
            .compression(true);

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 3307);
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.database, Some("testdb".to_string()));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.compression);
    }

    #[test]
    fn socket_addr_format() {
        let config = DriverConfig::new().host("db.example.com").port(3307);
        assert_eq!(config.socket_addr(), "db.example.com:3307");
    }

    #[test]
    fn connection_key_ignores_password() {
        let a = DriverConfig::new().user("u").database("d").password("one");
        let b = DriverConfig::new().user("u").database("d").password("two");
        assert_eq!(a.connection_key(), b.connection_key());

        let c = DriverConfig::new().user("u").database("other");
        assert_ne!(a.connection_key(), c.connection_key());
    }

    #[test]
    fn capability_flags_follow_config() {
        let flags = DriverConfig::new()
            .database("test")
            .compression(true)
            .capability_flags();
        assert!(flags & capabilities::CLIENT_CONNECT_WITH_DB != 0);
        assert!(flags & capabilities::CLIENT_COMPRESS != 0);
        assert!(flags & capabilities::CLIENT_PROTOCOL_41 != 0);

        let flags = DriverConfig::new().capability_flags();
        assert!(flags & capabilities::CLIENT_CONNECT_WITH_DB == 0);
        assert!(flags & capabilities::CLIENT_COMPRESS == 0);
    }

    #[test]
    fn serde_roundtrip() {
        let config = DriverConfig::new()
            .host("db.internal")
            .user("svc")
            .database("orders")
            .compression(true);
        let json = serde_json::to_string(&config).unwrap();
        let back: DriverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, "db.internal");
        assert_eq!(back.database.as_deref(), Some("orders"));
        assert!(back.compression);
        assert_eq!(back.connection_key(), config.connection_key());
    }

    #[test]
    fn block_size_capped_by_max_packet() {
        let config = DriverConfig::new().max_packet_size(1024);
        assert_eq!(config.max_block_size(), 1024);
        assert_eq!(DriverConfig::new().max_block_size(), MAX_BLOCK_SIZE);
    }
}
