//! Driver lifecycle.
//!
//! A [`Driver`] is one physical backend connection: it owns the packet
//! transport (over plain TCP, or the compression substrate once
//! negotiated), the session character set, the server capability flags,
//! and the bookkeeping the pool needs (creation time, process-unique id,
//! in-active-use flag).

#![allow(clippy::cast_possible_truncation)]

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sable_core::{Error, Result};
use sable_pool::PingResult;

use crate::auth;
use crate::compress::CompressedStream;
use crate::config::DriverConfig;
use crate::protocol::{Command, PacketReader, PacketType, PacketWriter, capabilities, charset};
use crate::stream::{NetStream, PacketStream};

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Parsed initial handshake packet from the server.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol version (must be 10)
    pub protocol_version: u8,
    /// Server version string
    pub server_version: String,
    /// Server-assigned connection id
    pub connection_id: u32,
    /// Server capability flags
    pub capabilities: u32,
    /// Server default charset
    pub charset: u8,
    /// Authentication plugin the server wants first
    pub auth_plugin: String,
    /// Authentication scramble
    pub auth_data: Vec<u8>,
}

/// Parse the server's initial handshake payload.
pub fn parse_handshake(payload: &[u8]) -> Result<Handshake> {
    let mut reader = PacketReader::new(payload);

    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| Error::protocol("missing protocol version"))?;
    if protocol_version != 10 {
        return Err(Error::protocol(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }

    let server_version = reader
        .read_null_string()
        .ok_or_else(|| Error::protocol("missing server version"))?;
    let connection_id = reader
        .read_u32_le()
        .ok_or_else(|| Error::protocol("missing connection id"))?;
    let auth_data_1 = reader
        .read_bytes(8)
        .ok_or_else(|| Error::protocol("missing auth scramble"))?;
    reader.skip(1); // filler

    let caps_lower = reader
        .read_u16_le()
        .ok_or_else(|| Error::protocol("missing capability flags"))?;
    let server_charset = reader.read_u8().unwrap_or(charset::DEFAULT_CHARSET);
    let _status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let caps = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let auth_data_len = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_u8().unwrap_or(0) as usize
    } else {
        0
    };
    reader.skip(10); // reserved

    let mut auth_data = auth_data_1.to_vec();
    if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len2 = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        if let Some(data2) = reader.read_bytes(len2) {
            let data2 = if data2.last() == Some(&0) {
                &data2[..data2.len() - 1]
            } else {
                data2
            };
            auth_data.extend_from_slice(data2);
        }
    }

    let auth_plugin = if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string().unwrap_or_default()
    } else {
        auth::plugins::MYSQL_NATIVE_PASSWORD.to_string()
    };

    Ok(Handshake {
        protocol_version,
        server_version,
        connection_id,
        capabilities: caps,
        charset: server_charset,
        auth_plugin,
        auth_data,
    })
}

/// One physical backend connection.
pub struct Driver {
    id: u64,
    stream: PacketStream<Box<dyn NetStream>>,
    server_version: String,
    connection_id: u32,
    server_capabilities: u32,
    charset: u8,
    created_at: Instant,
    open: bool,
    busy: bool,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.server_version)
            .field("open", &self.open)
            .field("busy", &self.busy)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Establish a new connection.
    ///
    /// TCP connect with timeout, handshake parse, password scramble,
    /// then switch to the compressed protocol if both sides negotiated
    /// `CLIENT_COMPRESS`.
    pub fn connect(config: &DriverConfig) -> Result<Self> {
        let addr = config
            .socket_addr()
            .to_socket_addrs()
            .map_err(|e| Error::connect(format!("cannot resolve {}: {e}", config.socket_addr())))?
            .next()
            .ok_or_else(|| {
                Error::connect(format!("{} resolved to no addresses", config.socket_addr()))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                Error::refused(format!("connection refused by {}", config.socket_addr()))
            } else {
                Error::connect(format!("failed to connect to {}: {e}", config.socket_addr()))
            }
        })?;
        tcp.set_nodelay(true).ok();
        tcp.set_read_timeout(Some(config.connect_timeout)).ok();
        tcp.set_write_timeout(Some(config.connect_timeout)).ok();

        let mut stream: PacketStream<Box<dyn NetStream>> =
            PacketStream::new(Box::new(tcp), config.max_block_size());

        stream.open_packet()?;
        let handshake = parse_handshake(&stream.read_payload()?)?;
        let client_caps = config.capability_flags() & handshake.capabilities;

        send_handshake_response(&mut stream, config, &handshake, client_caps)?;
        settle_auth(&mut stream, config, &handshake.auth_plugin)?;

        if client_caps & capabilities::CLIENT_COMPRESS != 0 {
            let plain = stream.into_inner();
            stream = PacketStream::new(
                Box::new(CompressedStream::new(plain)),
                config.max_block_size(),
            );
        }

        let driver = Self {
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            server_version: handshake.server_version,
            connection_id: handshake.connection_id,
            server_capabilities: handshake.capabilities,
            charset: config.charset,
            created_at: Instant::now(),
            open: true,
            busy: false,
        };
        tracing::debug!(
            id = driver.id,
            connection_id = driver.connection_id,
            server_version = %driver.server_version,
            compressed = client_caps & capabilities::CLIENT_COMPRESS != 0,
            "connection established"
        );
        Ok(driver)
    }

    /// Process-unique driver id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server-assigned connection id.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Server version string from the handshake.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Server capability flags from the handshake.
    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// Session character set.
    pub fn charset(&self) -> u8 {
        self.charset
    }

    /// Time since the connection was established.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether a caller currently holds this connection exclusively.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark the connection as exclusively held. Double activation means
    /// two callers would share one transport; it is logged, not fatal.
    pub fn set_busy(&mut self, busy: bool) {
        if busy && self.busy {
            tracing::warn!(id = self.id, "connection activated while already in use");
        }
        self.busy = busy;
    }

    /// The packet transport, for issuing commands and reading results.
    pub fn stream(&mut self) -> &mut PacketStream<Box<dyn NetStream>> {
        &mut self.stream
    }

    /// Liveness check (COM_PING).
    ///
    /// Any failure, transport or protocol, means the connection cannot
    /// be trusted; the outcome is a variant, not an error, because a
    /// dead connection during checkout is expected data.
    pub fn ping(&mut self) -> PingResult {
        if !self.open {
            return PingResult::Dead;
        }
        match self.round_trip(Command::Ping, &[]) {
            Ok(()) => PingResult::Alive,
            Err(e) => {
                tracing::debug!(id = self.id, error = %e, "ping failed");
                self.open = false;
                PingResult::Dead
            }
        }
    }

    /// Re-initialize server-side session state (COM_RESET_CONNECTION).
    pub fn reset_session(&mut self) -> Result<()> {
        self.round_trip(Command::ResetConnection, &[])
    }

    /// Close the connection. COM_QUIT is best effort; the server closes
    /// the socket without replying.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut writer = PacketWriter::new();
        writer.write_u8(Command::Quit as u8);
        if self.stream.send_packet(writer.as_bytes(), true).is_err() {
            tracing::trace!(id = self.id, "quit packet not delivered");
        }
        tracing::debug!(id = self.id, "connection closed");
    }

    /// Send a command packet and expect an OK response.
    fn round_trip(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let mut writer = PacketWriter::with_capacity(1 + payload.len());
        writer.write_u8(command as u8);
        writer.write_bytes(payload);
        self.stream.send_packet(writer.as_bytes(), true)?;

        self.stream.open_packet()?;
        let response = self.stream.read_payload()?;
        let Some(&first) = response.first() else {
            return Err(Error::protocol("empty command response"));
        };
        match PacketType::from_first_byte(first, response.len()) {
            PacketType::Ok => Ok(()),
            _ => Err(Error::protocol(format!(
                "unexpected response 0x{first:02X} to command 0x{:02X}",
                command as u8
            ))),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build and send the handshake response packet.
fn send_handshake_response(
    stream: &mut PacketStream<Box<dyn NetStream>>,
    config: &DriverConfig,
    handshake: &Handshake,
    client_caps: u32,
) -> Result<()> {
    let auth_response = compute_auth_response(config, &handshake.auth_plugin, &handshake.auth_data);

    let mut writer = PacketWriter::new();
    writer.write_u32_le(client_caps);
    writer.write_u32_le(config.max_packet_size);
    writer.write_u8(config.charset);
    writer.write_zeros(23);
    writer.write_null_string(&config.user);

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(&auth_response);
    } else if client_caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        // scrambles are 20 or 32 bytes, always below 256
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(&auth_response);
    } else {
        writer.write_bytes(&auth_response);
        writer.write_u8(0);
    }

    if client_caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        match config.database {
            Some(ref db) => writer.write_null_string(db),
            None => writer.write_u8(0),
        }
    }

    if client_caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(&handshake.auth_plugin);
    }

    // the handshake consumed sequence 0; the response continues at 1
    stream.send_packet(writer.as_bytes(), false)
}

/// Compute the scramble for the requested plugin.
fn compute_auth_response(config: &DriverConfig, plugin: &str, auth_data: &[u8]) -> Vec<u8> {
    let password = config.password.as_deref().unwrap_or("");
    match plugin {
        auth::plugins::CACHING_SHA2_PASSWORD => auth::caching_sha2_password(password, auth_data),
        // unknown plugins get the legacy scramble; the server answers
        // with an auth switch if it wants something else
        _ => auth::mysql_native_password(password, auth_data),
    }
}

/// Drive the post-response authentication exchange to completion:
/// OK, auth switch, or the caching_sha2 continuation codes.
fn settle_auth(
    stream: &mut PacketStream<Box<dyn NetStream>>,
    config: &DriverConfig,
    initial_plugin: &str,
) -> Result<()> {
    let mut current_plugin = initial_plugin.to_string();
    loop {
        stream.open_packet().map_err(auth_failure)?;
        let payload = stream.read_payload()?;
        let Some(&first) = payload.first() else {
            return Err(Error::protocol("empty authentication response"));
        };

        match first {
            0x00 => return Ok(()),
            // auth switch: plugin name, then a fresh scramble; 0xFE is
            // unambiguous here regardless of payload length
            0xFE => {
                let mut reader = PacketReader::new(&payload[1..]);
                current_plugin = reader
                    .read_null_string()
                    .ok_or_else(|| Error::protocol("missing plugin name in auth switch"))?;
                let auth_data = reader.read_rest();
                let response = compute_auth_response(config, &current_plugin, auth_data);
                stream.send_packet(&response, false)?;
            }
            0x01 => match payload.get(1) {
                Some(&auth::caching_sha2::FAST_AUTH_SUCCESS) => {
                    // the final OK follows on the next packet
                    stream.open_packet().map_err(auth_failure)?;
                    stream.read_payload()?;
                    return Ok(());
                }
                Some(&auth::caching_sha2::PERFORM_FULL_AUTH) => {
                    return Err(Error::auth(format!(
                        "server requires full authentication for '{current_plugin}', \
                         which needs TLS or RSA key exchange"
                    )));
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unknown auth continuation {other:?}"
                    )));
                }
            },
            _ => {
                return Err(Error::protocol(format!(
                    "unexpected packet 0x{first:02X} during authentication"
                )));
            }
        }
    }
}

/// During the auth exchange a server error packet means the credentials
/// were rejected, not that the protocol broke.
fn auth_failure(err: Error) -> Error {
    match err {
        Error::Protocol(p) => Error::auth(format!(
            "authentication failed: {} (code {})",
            p.message, p.code
        )),
        other => other,
    }
}
