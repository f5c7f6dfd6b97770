//! Error types for Sable operations.

use std::fmt;

/// The primary error type for all Sable operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, broken transport, auth)
    Connection(ConnectionError),
    /// Protocol errors (well-formed server error packets, malformed frames)
    Protocol(ProtocolError),
    /// Pool errors (checkout timeout, draining pool)
    Pool(PoolError),
    /// Configuration errors
    Config(String),
    /// I/O errors outside the packet transport
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused by the server
    Refused,
    /// Authentication failed
    Authentication,
    /// Transport failure mid-stream; fatal to the owning driver
    Broken,
}

/// A server-reported or wire-level protocol error.
///
/// `code` is the server error code when the server sent an error packet,
/// or 0 for a locally detected malformed frame.
#[derive(Debug)]
pub struct ProtocolError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Checkout timed out waiting for a free connection
    Timeout,
    /// Pool is draining; no new checkouts
    Draining,
    /// Invalid pool configuration
    Config,
}

impl Error {
    /// Shorthand for a broken-transport error wrapping an I/O failure.
    pub fn broken(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Broken,
            message: message.into(),
            source: Some(Box::new(source)),
        })
    }

    /// Shorthand for a connect-phase error.
    pub fn connect(message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a connection actively refused by the server.
    pub fn refused(message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for an authentication failure.
    pub fn auth(message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Authentication,
            message: message.into(),
            source: None,
        })
    }

    /// Shorthand for a locally detected protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            code: 0,
            sql_state: String::new(),
            message: message.into(),
        })
    }

    /// Shorthand for a pool checkout timeout.
    pub fn pool_timeout(message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: message.into(),
        })
    }

    /// Is this error fatal to the driver that produced it?
    ///
    /// A fatal error means the driver must not be returned to the idle
    /// pool; the holder is expected to discard it.
    pub fn is_fatal_to_driver(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Broken | ConnectionErrorKind::Connect
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Is this a retryable error (pool timeout)?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Pool(p) if p.kind == PoolErrorKind::Timeout)
    }

    /// Get the server error code if the server sent an error packet.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(p) if p.code != 0 => Some(p.code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => {
                if e.code != 0 {
                    write!(f, "Protocol error {}: {}", e.code, e.message)
                } else {
                    write!(f, "Protocol error: {}", e.message)
                }
            }
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.sql_state.is_empty() {
            write!(f, "{} (SQLSTATE {})", self.message, self.sql_state)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

/// Result type alias for Sable operations.
pub type Result<T> = std::result::Result<T, Error>;
