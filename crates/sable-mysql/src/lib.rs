//! MySQL wire transport for Sable.
//!
//! This crate implements the transport layer of the MySQL client
//! protocol from scratch over `std::net` primitives. It provides:
//!
//! - Packet framing with sequence numbers and multi-packet splitting
//! - Optional compressed protocol (zlib) as a transparent substrate
//! - Typed payload primitives (length-encoded integers, strings)
//! - Authentication (mysql_native_password, caching_sha2_password)
//! - Driver lifecycle: connect, ping, session reset, close
//! - Pool glue so drivers plug into `sable-pool`
//!
//! # Protocol overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Logical messages over 16MB - 1 split at that boundary
//! - An optional compressed framing negotiated at handshake
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_mysql::{Driver, DriverConfig};
//!
//! let config = DriverConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut driver = Driver::connect(&config)?;
//! ```

pub mod auth;
pub mod compress;
pub mod config;
pub mod driver;
pub mod pooled;
pub mod protocol;
pub mod stream;

pub use compress::CompressedStream;
pub use config::DriverConfig;
pub use driver::{Driver, Handshake};
pub use pooled::{DriverFactory, DriverPool, DriverPoolManager, PooledDriver, get_driver};
pub use stream::{NetStream, PacketStream};
