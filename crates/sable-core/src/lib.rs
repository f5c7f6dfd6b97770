//! Core types for the Sable database client.
//!
//! This crate provides the shared error taxonomy used by the wire
//! transport (`sable-mysql`) and the connection pool (`sable-pool`):
//!
//! - `Error` enum covering connection, protocol, pool, and config faults
//! - `Result` alias used throughout the workspace

pub mod error;

pub use error::{
    ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind, ProtocolError, Result,
};
