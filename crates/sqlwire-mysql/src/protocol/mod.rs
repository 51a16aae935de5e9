//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum frame payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple frames; a frame of exactly the maximum size
//! announces that another frame of the same message follows.

pub mod parser;
pub mod reader;
pub mod writer;

use std::fmt;
use std::ops::{BitAnd, BitOr};

use sqlwire_core::error::{ProtocolErrorKind, ServerError};
use sqlwire_core::{Error, Result};

pub use parser::PacketParser;
pub use reader::PacketReader;
pub use writer::{PacketWriter, frame_into};

/// Maximum payload size for a single MySQL frame (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flag bitmask advertised by client and server.
///
/// Behaviour after the greeting is governed by the intersection of both
/// sides' flags, never by either side's raw set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const LONG_PASSWORD: Self = Self(1);
    pub const FOUND_ROWS: Self = Self(1 << 1);
    pub const LONG_FLAG: Self = Self(1 << 2);
    pub const CONNECT_WITH_DB: Self = Self(1 << 3);
    pub const NO_SCHEMA: Self = Self(1 << 4);
    pub const COMPRESS: Self = Self(1 << 5);
    pub const LOCAL_FILES: Self = Self(1 << 7);
    pub const PROTOCOL_41: Self = Self(1 << 9);
    pub const INTERACTIVE: Self = Self(1 << 10);
    pub const SSL: Self = Self(1 << 11);
    pub const TRANSACTIONS: Self = Self(1 << 13);
    pub const SECURE_CONNECTION: Self = Self(1 << 15);
    pub const MULTI_STATEMENTS: Self = Self(1 << 16);
    pub const MULTI_RESULTS: Self = Self(1 << 17);
    pub const PLUGIN_AUTH: Self = Self(1 << 19);
    pub const CONNECT_ATTRS: Self = Self(1 << 20);
    pub const DEPRECATE_EOF: Self = Self(1 << 24);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bitwise AND: the flags both peers agree on.
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Bitwise OR.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Client flags used for every connection before per-connection options.
    ///
    /// `CONNECT_WITH_DB` and `SSL` are added only when a database or TLS
    /// is configured.
    pub const fn default_client() -> Self {
        Self(
            Self::LONG_PASSWORD.0
                | Self::LONG_FLAG.0
                | Self::PROTOCOL_41.0
                | Self::TRANSACTIONS.0
                | Self::SECURE_CONNECTION.0
                | Self::PLUGIN_AUTH.0,
        )
    }
}

impl BitAnd for CapabilityFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl BitOr for CapabilityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for CapabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityFlags({:#010x})", self.0)
    }
}

/// MySQL command codes (COM_xxx) sent by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Ping server
    Ping = 0x0e,
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

/// MySQL collation ids.
pub mod charset {
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;
    pub const UTF8MB4_0900_AI_CI: u8 = 255;
}

/// A MySQL frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }
}

/// A complete protocol message.
///
/// The payload is always whole: frames split at the maximum frame size
/// are joined before a `Packet` is handed out. `sequence_id` is the id of
/// the first frame; replies continue from the id after the last frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Vec<u8>,
    last_sequence_id: u8,
}

impl Packet {
    /// A packet carried by a single frame.
    pub fn new(sequence_id: u8, payload: Vec<u8>) -> Self {
        Self {
            sequence_id,
            payload,
            last_sequence_id: sequence_id,
        }
    }

    /// First payload byte, the message type marker for server responses.
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Number of wire frames this packet arrived in.
    pub fn frame_count(&self) -> usize {
        usize::from(self.last_sequence_id.wrapping_sub(self.sequence_id)) + 1
    }

    /// Sequence id the next frame of this exchange must carry.
    pub fn next_sequence_id(&self) -> u8 {
        self.last_sequence_id.wrapping_add(1)
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Human readable info string (if any)
    pub info: String,
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// A generic server response: `OK`, `EOF` or `ERR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(OkPacket),
    Eof(EofPacket),
    Err(ServerError),
}

impl Response {
    /// Decode an OK/EOF/ERR payload using the negotiated capabilities.
    ///
    /// `0xFE` payloads shorter than 9 bytes are EOF markers; longer ones
    /// carry the OK layout.
    pub fn parse(payload: &[u8], flags: CapabilityFlags) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        match reader.peek() {
            Some(0xFF) => reader
                .parse_err_packet(flags)
                .map(Response::Err)
                .ok_or_else(|| invalid_response("truncated ERR packet", payload)),
            Some(0xFE) if payload.len() < 9 => reader
                .parse_eof_packet(flags)
                .map(Response::Eof)
                .ok_or_else(|| invalid_response("truncated EOF packet", payload)),
            Some(0x00 | 0xFE) => reader
                .parse_ok_packet(flags)
                .map(Response::Ok)
                .ok_or_else(|| invalid_response("truncated OK packet", payload)),
            Some(other) => Err(invalid_response(
                format!("unexpected response marker {other:#04x}"),
                payload,
            )),
            None => Err(invalid_response("empty response", payload)),
        }
    }
}

/// Build an `InvalidResponse` error that keeps the offending bytes.
pub(crate) fn invalid_response(message: impl Into<String>, payload: &[u8]) -> Error {
    Error::Protocol(sqlwire_core::ProtocolError {
        kind: ProtocolErrorKind::InvalidResponse,
        message: message.into(),
        raw_data: Some(payload.to_vec()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        assert_eq!(header.to_bytes(), [0x56, 0x34, 0x12, 7]);
        assert_eq!(PacketHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_capability_intersection() {
        let client = CapabilityFlags::LONG_PASSWORD
            | CapabilityFlags::PROTOCOL_41
            | CapabilityFlags::SECURE_CONNECTION;
        let server = CapabilityFlags::LONG_PASSWORD | CapabilityFlags::CONNECT_WITH_DB;

        let combined = client & server;
        assert_eq!(combined, CapabilityFlags::LONG_PASSWORD);
        assert_eq!(combined.bits(), 1);
        assert!(!combined.contains(CapabilityFlags::PROTOCOL_41));
        assert!(!combined.contains(CapabilityFlags::CONNECT_WITH_DB));
    }

    #[test]
    fn test_capability_bits_match_wire_values() {
        assert_eq!(CapabilityFlags::LONG_PASSWORD.bits(), 1);
        assert_eq!(CapabilityFlags::LONG_FLAG.bits(), 4);
        assert_eq!(CapabilityFlags::CONNECT_WITH_DB.bits(), 8);
        assert_eq!(CapabilityFlags::PROTOCOL_41.bits(), 512);
        assert_eq!(CapabilityFlags::SSL.bits(), 2048);
        assert_eq!(CapabilityFlags::SECURE_CONNECTION.bits(), 32768);

        let mut flags = CapabilityFlags::empty();
        flags.insert(CapabilityFlags::SSL);
        assert!(flags.contains(CapabilityFlags::SSL));
        flags.remove(CapabilityFlags::SSL);
        assert_eq!(flags, CapabilityFlags::empty());
    }

    #[test]
    fn test_response_ok() {
        let flags = CapabilityFlags::PROTOCOL_41;
        let response = Response::parse(&[0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00], flags).unwrap();
        assert_eq!(
            response,
            Response::Ok(OkPacket {
                affected_rows: 1,
                last_insert_id: 42,
                status_flags: 2,
                warnings: 0,
                info: String::new(),
            })
        );
    }

    #[test]
    fn test_response_ok_without_protocol_41_skips_status() {
        let response =
            Response::parse(&[0x00, 0x03, 0x00], CapabilityFlags::empty()).unwrap();
        match response {
            Response::Ok(ok) => {
                assert_eq!(ok.affected_rows, 3);
                assert_eq!(ok.status_flags, 0);
            }
            other => panic!("expected OK, got {other:?}"),
        }
    }

    #[test]
    fn test_response_err_with_sql_state() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let response = Response::parse(&data, CapabilityFlags::PROTOCOL_41).unwrap();
        assert_eq!(
            response,
            Response::Err(ServerError {
                code: 1045,
                sql_state: Some("28000".to_string()),
                message: "Access denied".to_string(),
            })
        );
    }

    #[test]
    fn test_response_eof() {
        let response =
            Response::parse(&[0xFE, 0x01, 0x00, 0x02, 0x00], CapabilityFlags::PROTOCOL_41)
                .unwrap();
        assert_eq!(
            response,
            Response::Eof(EofPacket {
                warnings: 1,
                status_flags: 2,
            })
        );
    }

    #[test]
    fn test_response_malformed() {
        let flags = CapabilityFlags::PROTOCOL_41;
        for payload in [&[][..], &[0x00, 0x01][..], &[0xFF, 0x01][..], &[0x42][..]] {
            let err = Response::parse(payload, flags).unwrap_err();
            assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::InvalidResponse));
        }
    }
}
