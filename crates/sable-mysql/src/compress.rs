//! Compressed-protocol substrate.
//!
//! [`CompressedStream`] sits between the raw TCP stream and the packet
//! transport once `CLIENT_COMPRESS` has been negotiated. Each frame
//! carries a 7-byte header: 3-byte compressed length, 1-byte sequence,
//! 3-byte uncompressed length. An uncompressed length of zero means the
//! body is stored raw.
//!
//! From the packet transport's point of view this layer is invisible:
//! it implements `Read + Write` with the same byte-for-byte semantics
//! as the plain stream.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

/// Payloads below this size are sent raw; the frame header overhead and
/// deflate bookkeeping outweigh any gain.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Compressed frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 7;

/// A zlib-framed byte stream.
pub struct CompressedStream<S> {
    inner: S,
    sequence: u8,
    /// Outbound bytes waiting for the next frame flush.
    cache: Vec<u8>,
    /// Decompressed body of the current inbound frame.
    in_buffer: Vec<u8>,
    in_pos: usize,
}

impl<S: Read + Write> CompressedStream<S> {
    /// Wrap `inner` in the compressed framing.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            sequence: 0,
            cache: Vec::new(),
            in_buffer: Vec::new(),
            in_pos: 0,
        }
    }

    /// Consume the wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Sequence number of the next outbound frame.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Load the next inbound frame, decompressing if needed.
    fn load_frame(&mut self) -> io::Result<()> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.inner.read_exact(&mut header)?;

        let compressed_len = u32::from(header[0])
            | (u32::from(header[1]) << 8)
            | (u32::from(header[2]) << 16);
        self.sequence = header[3].wrapping_add(1);
        let uncompressed_len = u32::from(header[4])
            | (u32::from(header[5]) << 8)
            | (u32::from(header[6]) << 16);

        let mut body = vec![0u8; compressed_len as usize];
        self.inner.read_exact(&mut body)?;

        if uncompressed_len == 0 {
            self.in_buffer = body;
        } else {
            let mut decoded = Vec::with_capacity(uncompressed_len as usize);
            ZlibDecoder::new(body.as_slice()).read_to_end(&mut decoded)?;
            if decoded.len() != uncompressed_len as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "compressed frame decoded to {} bytes, header declared {}",
                        decoded.len(),
                        uncompressed_len
                    ),
                ));
            }
            self.in_buffer = decoded;
        }
        self.in_pos = 0;
        Ok(())
    }

    /// Write one frame: compressed when worthwhile, raw otherwise.
    fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() >= MIN_COMPRESS_LENGTH {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload)?;
            let compressed = encoder.finish()?;
            // only send compressed if it actually shrank
            if compressed.len() < payload.len() {
                self.write_frame_header(compressed.len(), payload.len())?;
                return self.inner.write_all(&compressed);
            }
        }
        self.write_frame_header(payload.len(), 0)?;
        self.inner.write_all(payload)
    }

    fn write_frame_header(
        &mut self,
        compressed_len: usize,
        uncompressed_len: usize,
    ) -> io::Result<()> {
        let header = [
            (compressed_len & 0xFF) as u8,
            ((compressed_len >> 8) & 0xFF) as u8,
            ((compressed_len >> 16) & 0xFF) as u8,
            self.sequence,
            (uncompressed_len & 0xFF) as u8,
            ((uncompressed_len >> 8) & 0xFF) as u8,
            ((uncompressed_len >> 16) & 0xFF) as u8,
        ];
        self.sequence = self.sequence.wrapping_add(1);
        self.inner.write_all(&header)
    }
}

impl<S: Read + Write> Read for CompressedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.in_pos == self.in_buffer.len() {
            self.load_frame()?;
        }
        let available = self.in_buffer.len() - self.in_pos;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.in_buffer[self.in_pos..self.in_pos + n]);
        self.in_pos += n;
        Ok(n)
    }
}

impl<S: Read + Write> Write for CompressedStream<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.cache.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.cache.is_empty() {
            let payload = std::mem::take(&mut self.cache);
            self.write_frame(&payload)?;
        }
        self.inner.flush()
    }
}
