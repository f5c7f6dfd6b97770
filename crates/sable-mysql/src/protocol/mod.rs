//! MySQL wire protocol definitions.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! A logical message longer than [`MAX_BLOCK_SIZE`] is split across
//! consecutive packets, each filled to the block size except the last;
//! an exact multiple is terminated by an explicit zero-length packet.

pub mod reader;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

/// Maximum payload size of a single packet (2^24 - 1 bytes).
///
/// Logical messages larger than this are split at this boundary.
pub const MAX_BLOCK_SIZE: usize = 0xFF_FF_FF;

/// First payload byte of a server error packet.
pub const ERROR_MARKER: u8 = 0xFF;

/// First payload byte of an end-of-result (EOF) packet.
pub const LAST_PACKET_MARKER: u8 = 0xFE;

/// An EOF packet is identified by [`LAST_PACKET_MARKER`] combined with a
/// payload shorter than this threshold. Inherited wire-format behavior:
/// `0xFE` alone is ambiguous with length-encoded integers in row data.
pub const LAST_PACKET_THRESHOLD: usize = 9;

/// MySQL capability flags (client and server).
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;

    /// Default client capabilities requested by the driver.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_TRANSACTIONS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// MySQL command codes used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
    /// Reset session state
    ResetConnection = 0x1f,
}

/// MySQL character set codes.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;

    /// Default charset for new connections (utf8mb4).
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_0900_AI_CI;
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with a short payload)
    Eof,
    /// Anything else (row data, handshake, auth continuation)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of a payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            ERROR_MARKER => PacketType::Error,
            LAST_PACKET_MARKER if payload_len < LAST_PACKET_THRESHOLD => PacketType::Eof,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
}

/// Parsed error packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Server error code
    pub error_code: u16,
    /// SQL state (5 characters, protocol 4.1+)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_roundtrip() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        let parsed = PacketHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed.payload_length, 0x0012_3456);
        assert_eq!(parsed.sequence_id, 7);
    }

    #[test]
    fn packet_header_max_block() {
        let header = PacketHeader {
            payload_length: MAX_BLOCK_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 7), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        // A long payload starting with 0xFE is data, not EOF
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(PacketType::from_first_byte(0x42, 10), PacketType::Data);
    }
}
