//! Server greeting and client handshake response payloads.

use sqlwire_core::error::ProtocolErrorKind;
use sqlwire_core::{Error, Result};

use crate::auth::SCRAMBLE_LEN;
use crate::protocol::{CapabilityFlags, PacketReader, PacketWriter};

/// The only greeting format this client speaks.
pub const PROTOCOL_VERSION: u8 = 10;

/// The initial handshake packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    /// Server thread id for this connection
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    /// Default collation id of the server
    pub collation: u8,
    pub status_flags: u16,
    /// Challenge seed: 8 bytes, 20 with the 4.1 extension
    pub seed: Vec<u8>,
    /// Authentication mechanism the server expects first
    pub auth_plugin: Option<String>,
}

impl Handshake {
    /// Parse a v10 greeting.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| truncated("protocol version"))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::protocol(
                ProtocolErrorKind::InvalidHandshake,
                format!("unsupported protocol version {protocol_version}"),
            ));
        }

        let server_version = reader
            .read_terminated_string()
            .ok_or_else(|| truncated("server version"))?;
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| truncated("connection id"))?;
        let mut seed = reader
            .read_bytes(8)
            .ok_or_else(|| truncated("auth seed"))?
            .to_vec();
        if !reader.skip(1) {
            return Err(truncated("filler"));
        }
        let caps_low = reader
            .read_u16_le()
            .ok_or_else(|| truncated("capability flags"))?;

        let collation = reader.read_u8().ok_or_else(|| truncated("collation"))?;
        let status_flags = reader
            .read_u16_le()
            .ok_or_else(|| truncated("status flags"))?;
        let caps_high = reader
            .read_u16_le()
            .ok_or_else(|| truncated("capability flags"))?;
        let capabilities =
            CapabilityFlags::from_bits(u32::from(caps_low) | (u32::from(caps_high) << 16));

        let auth_data_len = reader
            .read_u8()
            .ok_or_else(|| truncated("auth data length"))?;
        if !reader.skip(10) {
            return Err(truncated("reserved bytes"));
        }

        if capabilities.contains(CapabilityFlags::SECURE_CONNECTION) {
            // At least 13 bytes: the rest of the seed plus its NUL.
            let len = (usize::from(auth_data_len).saturating_sub(8)).max(13);
            let part2 = reader
                .read_bytes(len)
                .ok_or_else(|| truncated("auth seed extension"))?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            seed.extend_from_slice(part2);
        }

        let auth_plugin = if capabilities.contains(CapabilityFlags::PLUGIN_AUTH) {
            Some(reader.read_null_string()).filter(|name| !name.is_empty())
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capabilities,
            collation,
            status_flags,
            seed,
            auth_plugin,
        })
    }

    /// Does the server speak the 4.1 extension of the greeting?
    pub fn is_extended_protocol(&self) -> bool {
        self.auth_plugin.is_some() || self.seed.len() > 8
    }
}

fn truncated(field: &str) -> Error {
    Error::protocol(
        ProtocolErrorKind::InvalidHandshake,
        format!("greeting truncated at {field}"),
    )
}

/// The client's reply to the greeting.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    /// Negotiated flags (client AND server)
    pub flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub collation: u8,
    pub user: &'a str,
    /// Scrambled password; empty when there is no password
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

impl HandshakeResponse<'_> {
    /// Encode the 4.1 handshake response payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(64 + self.user.len());
        write_client_header(&mut writer, self.flags, self.max_packet_size, self.collation);

        writer.write_null_string(self.user);

        if self.flags.contains(CapabilityFlags::SECURE_CONNECTION) && !self.auth_response.is_empty()
        {
            debug_assert!(self.auth_response.len() <= SCRAMBLE_LEN);
            writer.write_u8(self.auth_response.len() as u8);
            writer.write_bytes(self.auth_response);
        } else {
            writer.write_u8(0);
        }

        if self.flags.contains(CapabilityFlags::CONNECT_WITH_DB) {
            writer.write_null_string(self.database.unwrap_or_default());
        }

        if self.flags.contains(CapabilityFlags::PLUGIN_AUTH) {
            writer.write_null_string(self.auth_plugin);
        }

        writer.into_bytes()
    }
}

/// The 32-byte SSL request sent before the TLS upgrade.
pub fn ssl_request(flags: CapabilityFlags, max_packet_size: u32, collation: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(32);
    write_client_header(
        &mut writer,
        flags.union(CapabilityFlags::SSL),
        max_packet_size,
        collation,
    );
    writer.into_bytes()
}

fn write_client_header(
    writer: &mut PacketWriter,
    flags: CapabilityFlags,
    max_packet_size: u32,
    collation: u8,
) {
    writer.write_u32_le(flags.bits());
    writer.write_u32_le(max_packet_size);
    writer.write_u8(collation);
    writer.write_zeros(23);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::plugins;

    /// A MySQL 8 style greeting.
    pub(crate) fn greeting(capabilities: CapabilityFlags, plugin: &str) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        writer.write_u8(PROTOCOL_VERSION);
        writer.write_null_string("8.0.36");
        writer.write_u32_le(42);
        writer.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        writer.write_u8(0);
        writer.write_u16_le((capabilities.bits() & 0xFFFF) as u16);
        writer.write_u8(255);
        writer.write_u16_le(0x0002);
        writer.write_u16_le((capabilities.bits() >> 16) as u16);
        writer.write_u8(21);
        writer.write_zeros(10);
        writer.write_bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        writer.write_u8(0);
        writer.write_null_string(plugin);
        writer.into_bytes()
    }

    pub(crate) fn server_caps() -> CapabilityFlags {
        CapabilityFlags::default_client()
            | CapabilityFlags::CONNECT_WITH_DB
            | CapabilityFlags::SSL
            | CapabilityFlags::DEPRECATE_EOF
    }

    #[test]
    fn test_parse_greeting() {
        let handshake =
            Handshake::parse(&greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD)).unwrap();
        assert_eq!(handshake.protocol_version, 10);
        assert_eq!(handshake.server_version, "8.0.36");
        assert_eq!(handshake.connection_id, 42);
        assert_eq!(handshake.capabilities, server_caps());
        assert_eq!(handshake.collation, 255);
        assert_eq!(handshake.status_flags, 2);
        assert_eq!(handshake.seed, (1..=20).collect::<Vec<u8>>());
        assert_eq!(
            handshake.auth_plugin.as_deref(),
            Some(plugins::MYSQL_NATIVE_PASSWORD)
        );
        assert!(handshake.is_extended_protocol());
    }

    #[test]
    fn test_parse_rejects_other_versions() {
        let mut payload = greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD);
        payload[0] = 9;
        let err = Handshake::parse(&payload).unwrap_err();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::InvalidHandshake));
    }

    #[test]
    fn test_parse_truncated_greeting() {
        let payload = greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD);
        // Every cut before the seed extension ends is a truncation.
        for len in [0, 1, 5, 10, 20, 30, 45] {
            let err = Handshake::parse(&payload[..len]).unwrap_err();
            assert_eq!(
                err.protocol_kind(),
                Some(ProtocolErrorKind::InvalidHandshake),
                "len {len}"
            );
        }
    }

    #[test]
    fn test_short_seed_is_not_extended() {
        let mut caps = server_caps();
        caps.remove(CapabilityFlags::SECURE_CONNECTION);
        caps.remove(CapabilityFlags::PLUGIN_AUTH);
        let handshake = Handshake::parse(&greeting(caps, "")).unwrap();
        assert_eq!(handshake.seed.len(), 8);
        assert_eq!(handshake.auth_plugin, None);
        assert!(!handshake.is_extended_protocol());
    }

    #[test]
    fn test_response_layout() {
        let flags = CapabilityFlags::PROTOCOL_41
            | CapabilityFlags::SECURE_CONNECTION
            | CapabilityFlags::CONNECT_WITH_DB;
        let scramble = [0xAB; 20];
        let payload = HandshakeResponse {
            flags,
            max_packet_size: 0,
            collation: 33,
            user: "root",
            auth_response: &scramble,
            database: Some("shop"),
            auth_plugin: plugins::MYSQL_NATIVE_PASSWORD,
        }
        .encode();

        assert_eq!(&payload[0..4], &flags.bits().to_le_bytes());
        assert_eq!(&payload[4..8], &[0, 0, 0, 0]);
        assert_eq!(payload[8], 33);
        assert!(payload[9..32].iter().all(|&b| b == 0));
        assert_eq!(&payload[32..37], b"root\0");
        assert_eq!(payload[37], 20);
        assert_eq!(&payload[38..58], &scramble);
        assert_eq!(&payload[58..], b"shop\0");
    }

    #[test]
    fn test_response_without_password() {
        let flags = CapabilityFlags::PROTOCOL_41
            | CapabilityFlags::SECURE_CONNECTION
            | CapabilityFlags::PLUGIN_AUTH;
        let payload = HandshakeResponse {
            flags,
            max_packet_size: 1024,
            collation: 255,
            user: "app",
            auth_response: &[],
            database: Some("ignored"),
            auth_plugin: plugins::MYSQL_NATIVE_PASSWORD,
        }
        .encode();

        assert_eq!(&payload[4..8], &1024_u32.to_le_bytes());
        assert_eq!(&payload[32..36], b"app\0");
        assert_eq!(payload[36], 0);
        // No CONNECT_WITH_DB: the plugin name follows directly.
        assert_eq!(&payload[37..], b"mysql_native_password\0");
    }

    #[test]
    fn test_ssl_request() {
        let payload = ssl_request(CapabilityFlags::PROTOCOL_41, 16, 45);
        assert_eq!(payload.len(), 32);
        let flags = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(
            flags,
            (CapabilityFlags::PROTOCOL_41 | CapabilityFlags::SSL).bits()
        );
        assert_eq!(payload[8], 45);
    }
}
