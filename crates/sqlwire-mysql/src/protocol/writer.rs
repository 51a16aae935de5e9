//! Outbound payload building and frame serialization.
//!
//! [`PacketWriter`] assembles one logical payload. [`frame_into`] splits a
//! payload into wire frames inside a caller-owned buffer, so a connection
//! can reuse one scratch allocation for every write.

use crate::protocol::{Command, MAX_PACKET_SIZE, PacketHeader};

/// Builder for a single payload.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Start a command payload: the command byte followed by its body.
    pub fn command(command: Command, body: &[u8]) -> Self {
        let mut writer = Self::with_capacity(1 + body.len());
        writer.write_u8(command as u8);
        writer.write_bytes(body);
        writer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write the low three bytes of `value`, little-endian.
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - below 251: 1 byte
    /// - 0xFC + 2 bytes: values below 2^16
    /// - 0xFD + 3 bytes: values below 2^24
    /// - 0xFE + 8 bytes: everything else
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

/// Frame `payload` into `out`, starting at `sequence_id`.
///
/// `out` is cleared first and keeps its capacity between calls. Each frame
/// carries at most `max_payload` bytes; a payload whose length is a multiple
/// of `max_payload` (including an empty one) ends with an empty frame.
/// Returns the sequence id for the next outbound frame.
pub fn frame_into(out: &mut Vec<u8>, payload: &[u8], sequence_id: u8, max_payload: usize) -> u8 {
    debug_assert!(max_payload > 0 && max_payload <= MAX_PACKET_SIZE);

    out.clear();
    out.reserve(payload.len() + PacketHeader::SIZE * (payload.len() / max_payload + 1));

    let mut sequence_id = sequence_id;
    let mut chunks = payload.chunks(max_payload);
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);

        if chunk.len() < max_payload {
            return sequence_id;
        }
    }
}

/// Number of frames [`frame_into`] produces for a payload of `len` bytes.
pub fn frame_count(len: usize, max_payload: usize) -> usize {
    len / max_payload + 1
}
