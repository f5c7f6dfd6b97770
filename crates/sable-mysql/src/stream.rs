//! Packet-framing transport.
//!
//! [`PacketStream`] turns an ordered byte stream into MySQL packets and
//! back. Inbound, it reassembles logical payloads that span multiple
//! packets; outbound, it splits logical messages at every
//! `max_block_size` boundary, emitting a fresh header per block and a
//! zero-length terminator when the message length is an exact multiple
//! of the block size.
//!
//! The stream also carries the typed read/write primitives of the wire
//! format: fixed-width little-endian integers, length-encoded integers
//! (with the field-length vs. packed-integer follow-on asymmetry), and
//! length-prefixed / null-terminated strings.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use sable_core::{Error, ProtocolError, Result};

use crate::protocol::{
    ERROR_MARKER, LAST_PACKET_MARKER, LAST_PACKET_THRESHOLD, PacketHeader, PacketReader,
};

/// Object-safe alias for the byte streams a transport can sit on:
/// a plain TCP stream or the compression substrate.
pub trait NetStream: Read + Write + Send {}

impl<T: Read + Write + Send> NetStream for T {}

/// Wrap an I/O failure as a broken-transport error, fatal to the driver.
fn broken(err: io::Error) -> Error {
    Error::broken("connection broken", err)
}

/// A packet-framed view over an ordered byte stream.
pub struct PacketStream<S> {
    inner: S,
    sequence: u8,
    max_block_size: usize,
    // inbound packet state
    in_length: usize,
    in_read: usize,
    is_last_packet: bool,
    peeked: Option<u8>,
    // outbound logical message state
    staging: Vec<u8>,
    out_length: usize,
    out_written: usize,
}

impl<S: Read + Write> PacketStream<S> {
    /// Create a transport over `inner`, splitting logical messages at
    /// `max_block_size`.
    pub fn new(inner: S, max_block_size: usize) -> Self {
        Self {
            inner,
            sequence: 0,
            max_block_size,
            in_length: 0,
            in_read: 0,
            is_last_packet: false,
            peeked: None,
            staging: Vec::new(),
            out_length: 0,
            out_written: 0,
        }
    }

    /// Consume the transport and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Current sequence number (the one the next outbound packet gets).
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// The negotiated per-packet payload cap.
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Whether the packet opened last was an end-of-result marker.
    pub fn is_last_packet(&self) -> bool {
        self.is_last_packet
    }

    /// Open the next packet.
    ///
    /// Discards any unread remainder of the previous logical payload,
    /// reads the header, and peeks the first payload byte:
    ///
    /// - an error marker consumes the server error packet and fails with
    ///   [`Error::Protocol`] carrying the server code and message;
    /// - the last-packet marker on a short payload sets
    ///   [`is_last_packet`](Self::is_last_packet).
    ///
    /// Returns the payload length of the opened packet.
    pub fn open_packet(&mut self) -> Result<usize> {
        let mut scratch = [0u8; 512];
        loop {
            match Read::read(self, &mut scratch) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(broken(e)),
            }
        }

        self.read_header().map_err(broken)?;
        self.is_last_packet = false;

        if self.in_length > 0 {
            let first = self.peek_byte()?;
            if first == ERROR_MARKER {
                return Err(self.consume_server_error());
            }
            if first == LAST_PACKET_MARKER && self.in_length < LAST_PACKET_THRESHOLD {
                self.is_last_packet = true;
            }
        }

        Ok(self.in_length)
    }

    /// Peek the first unconsumed payload byte without advancing.
    pub fn peek_byte(&mut self) -> Result<u8> {
        if let Some(b) = self.peeked {
            return Ok(b);
        }
        if self.in_read == self.in_length {
            return Err(Error::protocol("peek past end of packet"));
        }
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b).map_err(broken)?;
        self.in_read += 1;
        self.peeked = Some(b[0]);
        Ok(b[0])
    }

    /// Read the rest of the current logical payload into a buffer.
    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(self.in_length - self.in_read + 1);
        let mut chunk = [0u8; 4096];
        loop {
            let n = Read::read(self, &mut chunk).map_err(broken)?;
            if n == 0 {
                break;
            }
            payload.extend_from_slice(&chunk[..n]);
        }
        Ok(payload)
    }

    /// Begin a logical outbound message of `length` bytes.
    ///
    /// Subsequent [`Write`] calls stream the message out, one header per
    /// block. A zero-length message emits its terminator packet
    /// immediately. Any staged undeclared bytes are dropped.
    pub fn start_output(&mut self, length: usize, reset_sequence: bool) -> Result<()> {
        if reset_sequence {
            self.sequence = 0;
        }
        self.staging.clear();
        self.out_written = 0;
        if length == 0 {
            self.out_length = 0;
            self.write_block_header(0).map_err(broken)?;
            self.inner.flush().map_err(broken)?;
            return Ok(());
        }
        self.out_length = length;
        Ok(())
    }

    /// Send one complete logical message.
    pub fn send_packet(&mut self, payload: &[u8], reset_sequence: bool) -> Result<()> {
        self.start_output(payload.len(), reset_sequence)?;
        if !payload.is_empty() {
            self.emit(payload).map_err(broken)?;
            self.inner.flush().map_err(broken)?;
        }
        Ok(())
    }

    // ---- typed primitives (streaming) ----

    /// Read one payload byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        let n = Read::read(self, &mut b).map_err(broken)?;
        if n == 0 {
            return Err(Error::protocol("unexpected end of payload"));
        }
        Ok(b[0])
    }

    /// Read a little-endian integer of 1..=8 bytes.
    pub fn read_integer_le(&mut self, width: usize) -> Result<u64> {
        debug_assert!(width >= 1 && width <= 8);
        let mut value = 0u64;
        for shift in 0..width {
            value |= u64::from(self.read_byte()?) << (8 * shift);
        }
        Ok(value)
    }

    /// Read a length-encoded field length.
    ///
    /// `0..=250` literal, `251` NULL (`None`), `252`/`253`/`254` followed
    /// by a 2/3/8-byte integer.
    pub fn read_field_length(&mut self) -> Result<Option<u64>> {
        match self.read_byte()? {
            n @ 0..=250 => Ok(Some(u64::from(n))),
            251 => Ok(None),
            252 => self.read_integer_le(2).map(Some),
            253 => self.read_integer_le(3).map(Some),
            254 => self.read_integer_le(8).map(Some),
            marker => Err(Error::protocol(format!(
                "invalid field length marker 0x{marker:02X}"
            ))),
        }
    }

    /// Read a generic packed integer.
    ///
    /// Same prefix scheme as [`read_field_length`](Self::read_field_length)
    /// except `254` is followed by a 4-byte integer. The asymmetry is
    /// inherited wire-format behavior and must be preserved per call site.
    pub fn read_packed_integer(&mut self) -> Result<u64> {
        match self.read_byte()? {
            n @ 0..=250 => Ok(u64::from(n)),
            252 => self.read_integer_le(2),
            253 => self.read_integer_le(3),
            254 => self.read_integer_le(4),
            marker => Err(Error::protocol(format!(
                "invalid packed integer marker 0x{marker:02X}"
            ))),
        }
    }

    /// Read a length-prefixed string (`None` for the NULL marker).
    pub fn read_string_lenenc(&mut self) -> Result<Option<String>> {
        let Some(len) = self.read_field_length()? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = Read::read(self, &mut buf[filled..]).map_err(broken)?;
            if n == 0 {
                return Err(Error::protocol("truncated length-prefixed string"));
            }
            filled += n;
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Read a null-terminated string.
    pub fn read_string_null(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_byte()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Write a little-endian integer of 1..=8 bytes.
    pub fn write_integer_le(&mut self, value: u64, width: usize) -> Result<()> {
        debug_assert!(width >= 1 && width <= 8);
        let bytes = value.to_le_bytes();
        Write::write_all(self, &bytes[..width]).map_err(broken)
    }

    /// Write a length-encoded field length (`None` writes the NULL marker).
    pub fn write_field_length(&mut self, value: Option<u64>) -> Result<()> {
        let Some(value) = value else {
            return self.write_integer_le(251, 1);
        };
        if value <= 250 {
            self.write_integer_le(value, 1)
        } else if value < 0x10000 {
            self.write_integer_le(252, 1)?;
            self.write_integer_le(value, 2)
        } else if value < 0x0100_0000 {
            self.write_integer_le(253, 1)?;
            self.write_integer_le(value, 3)
        } else {
            self.write_integer_le(254, 1)?;
            self.write_integer_le(value, 8)
        }
    }

    /// Write a length-prefixed string.
    pub fn write_string_lenenc(&mut self, s: &str) -> Result<()> {
        self.write_field_length(Some(s.len() as u64))?;
        Write::write_all(self, s.as_bytes()).map_err(broken)
    }

    /// Write a null-terminated string.
    pub fn write_string_null(&mut self, s: &str) -> Result<()> {
        Write::write_all(self, s.as_bytes()).map_err(broken)?;
        self.write_integer_le(0, 1)
    }

    // ---- internals ----

    /// Read the next packet header, tracking the sequence number.
    fn read_header(&mut self) -> io::Result<()> {
        let mut raw = [0u8; 4];
        self.inner.read_exact(&mut raw)?;
        let header = PacketHeader::from_bytes(&raw);
        self.sequence = header.sequence_id.wrapping_add(1);
        self.in_length = header.payload_length as usize;
        self.in_read = 0;
        Ok(())
    }

    /// Consume a server error packet and convert it to a typed error.
    fn consume_server_error(&mut self) -> Error {
        let mut buf = vec![0u8; self.in_length];
        let mut filled = 0;
        while filled < buf.len() {
            match Read::read(self, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return broken(e),
            }
        }
        buf.truncate(filled);

        match PacketReader::new(&buf).parse_err_packet() {
            Some(err) => Error::Protocol(ProtocolError {
                code: err.error_code,
                sql_state: err.sql_state,
                message: err.error_message,
            }),
            None => Error::protocol("malformed server error packet"),
        }
    }

    /// Write one packet header and advance the sequence.
    fn write_block_header(&mut self, payload_length: usize) -> io::Result<()> {
        let header = PacketHeader {
            payload_length: payload_length as u32,
            sequence_id: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.inner.write_all(&header.to_bytes())
    }

    /// Stream `data` into the declared logical message, inserting a
    /// header at every block boundary and the terminator when an exact
    /// multiple of the block size completes.
    fn emit(&mut self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.out_written == self.out_length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "write exceeds declared message length",
                ));
            }
            if self.out_written % self.max_block_size == 0 {
                let block = (self.out_length - self.out_written).min(self.max_block_size);
                self.write_block_header(block)?;
            }
            let block_remaining = self.max_block_size - (self.out_written % self.max_block_size);
            let n = rest
                .len()
                .min(block_remaining)
                .min(self.out_length - self.out_written);
            self.inner.write_all(&rest[..n])?;
            self.out_written += n;
            rest = &rest[n..];
        }

        if self.out_length > 0 && self.out_written == self.out_length {
            if self.out_length % self.max_block_size == 0 {
                self.write_block_header(0)?;
            }
            self.out_length = 0;
            self.out_written = 0;
        }
        Ok(())
    }
}

impl<S: Read + Write> Read for PacketStream<S> {
    /// Read across packet boundaries.
    ///
    /// When the current packet is exactly `max_block_size` long and fully
    /// consumed, the next header is loaded transparently. Returns a short
    /// count at the true end of the logical payload.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if let Some(b) = self.peeked.take() {
                buf[total] = b;
                total += 1;
                continue;
            }
            if self.in_read == self.in_length {
                if self.in_length == self.max_block_size {
                    // continuation packet expected
                    self.read_header()?;
                    if self.in_length == 0 {
                        break; // zero-length terminator
                    }
                    continue;
                }
                break;
            }
            let available = self.in_length - self.in_read;
            let n = available.min(buf.len() - total);
            self.inner.read_exact(&mut buf[total..total + n])?;
            self.in_read += n;
            total += n;
        }
        Ok(total)
    }
}

impl<S: Read + Write> Write for PacketStream<S> {
    /// Append to the staging buffer when no message length is declared;
    /// otherwise stream into the declared message.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.out_length == 0 {
            self.staging.extend_from_slice(data);
        } else {
            self.emit(data)?;
        }
        Ok(data.len())
    }

    /// Flush staged bytes as one logical message, then flush the
    /// underlying stream.
    fn flush(&mut self) -> io::Result<()> {
        if self.out_length == 0 && !self.staging.is_empty() {
            let payload = std::mem::take(&mut self.staging);
            self.out_length = payload.len();
            self.out_written = 0;
            self.emit(&payload)?;
        }
        self.inner.flush()
    }
}
