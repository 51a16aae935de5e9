//! Connection-phase state machine.
//!
//! [`HandshakeMachine`] performs no I/O. The caller reads packets off the
//! wire, feeds them in as [`HandshakeEvent`]s, and carries out the
//! [`HandshakeAction`] each step returns:
//!
//! ```text
//! AwaitingGreeting --greeting--> ResponseSent --OK--> Authenticated
//!        |                          |    ^
//!        | (TLS)                    |    | auth switch
//!        v                          v    |
//! TlsUpgradeRequested --TLS up--> AwaitingAuthResult
//! ```
//!
//! Any error moves the machine to `Failed`, which accepts nothing further.

use std::fmt;

use sqlwire_core::error::{ConnectionErrorKind, ProtocolErrorKind};
use sqlwire_core::{Error, Result};

use crate::auth::{self, plugins};
use crate::config::SslMode;
use crate::handshake::{Handshake, HandshakeResponse, ssl_request};
use crate::protocol::{CapabilityFlags, OkPacket, Packet, PacketReader, invalid_response};

/// Where the connection phase currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing received yet
    AwaitingGreeting,
    /// SSL request sent; waiting for the transport to finish the TLS upgrade
    TlsUpgradeRequested,
    /// Handshake response sent
    ResponseSent,
    /// Auth switch answered; waiting for the verdict
    AwaitingAuthResult,
    /// The server accepted the credentials
    Authenticated,
    /// A fatal error occurred
    Failed,
}

/// Something that happened on the transport.
#[derive(Debug)]
pub enum HandshakeEvent {
    /// A complete packet arrived
    PacketReceived(Packet),
    /// The TLS upgrade requested by [`HandshakeAction::UpgradeTls`] finished
    TlsEstablished,
    /// The transport failed
    IoError(std::io::Error),
    /// The peer closed the stream
    Closed,
}

/// What the caller must do next.
#[derive(Debug)]
pub enum HandshakeAction {
    /// Write `payload` as a packet starting at `sequence_id`, then read
    /// the next packet.
    Send { payload: Vec<u8>, sequence_id: u8 },
    /// Write `ssl_request` at `sequence_id`, upgrade the stream to TLS and
    /// report [`HandshakeEvent::TlsEstablished`].
    UpgradeTls { ssl_request: Vec<u8>, sequence_id: u8 },
    /// Done; the connection may start issuing commands.
    Authenticated(Box<Session>),
}

/// The outcome of a successful connection phase.
#[derive(Debug, Clone)]
pub struct Session {
    pub handshake: Handshake,
    /// Client AND server capabilities; governs everything after the handshake
    pub flags: CapabilityFlags,
    /// The final OK packet (status flags, warnings)
    pub ok: OkPacket,
    /// Whether the stream was upgraded to TLS
    pub tls: bool,
}

/// Inputs to the connection phase.
#[derive(Clone, Default)]
pub struct HandshakeOptions {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Capabilities the client is willing to use
    pub client_flags: CapabilityFlags,
    /// Collation id for the session; the server default when unset
    pub collation: Option<u8>,
    pub max_packet_size: u32,
    pub ssl_mode: SslMode,
    /// Whether the transport is able to perform a TLS upgrade
    pub tls_available: bool,
    /// Send the password in clear text even without TLS
    pub allow_cleartext_password: bool,
}

impl fmt::Debug for HandshakeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeOptions")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("client_flags", &self.client_flags)
            .field("ssl_mode", &self.ssl_mode)
            .field("tls_available", &self.tls_available)
            .field("allow_cleartext_password", &self.allow_cleartext_password)
            .finish_non_exhaustive()
    }
}

/// Sans-IO driver for greeting, optional TLS upgrade and authentication.
#[derive(Debug)]
pub struct HandshakeMachine {
    options: HandshakeOptions,
    state: HandshakeState,
    handshake: Option<Handshake>,
    flags: CapabilityFlags,
    /// Sequence id the next inbound packet must carry
    expected_sequence: u8,
    /// Sequence id for the response deferred by the TLS upgrade
    pending_sequence: u8,
    tls: bool,
}

impl HandshakeMachine {
    pub fn new(options: HandshakeOptions) -> Self {
        Self {
            options,
            state: HandshakeState::AwaitingGreeting,
            handshake: None,
            flags: CapabilityFlags::empty(),
            expected_sequence: 0,
            pending_sequence: 0,
            tls: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The greeting, once it has been received.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Negotiated capabilities; empty before the greeting.
    pub fn flags(&self) -> CapabilityFlags {
        self.flags
    }

    /// Advance the machine by one event.
    ///
    /// Any error is fatal: the machine moves to [`HandshakeState::Failed`]
    /// and the caller must close the transport.
    pub fn step(&mut self, event: HandshakeEvent) -> Result<HandshakeAction> {
        let result = self.dispatch(event);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn dispatch(&mut self, event: HandshakeEvent) -> Result<HandshakeAction> {
        match (self.state, event) {
            (HandshakeState::Failed, _) => Err(Error::closed()),
            (_, HandshakeEvent::IoError(err)) => Err(Error::Io(err)),
            (_, HandshakeEvent::Closed) => Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "server closed the connection during the handshake",
            )),
            (HandshakeState::AwaitingGreeting, HandshakeEvent::PacketReceived(packet)) => {
                self.on_greeting(&packet)
            }
            (HandshakeState::TlsUpgradeRequested, HandshakeEvent::TlsEstablished) => {
                self.tls = true;
                tracing::debug!("TLS established");
                Ok(self.send_response(self.pending_sequence))
            }
            (
                HandshakeState::ResponseSent | HandshakeState::AwaitingAuthResult,
                HandshakeEvent::PacketReceived(packet),
            ) => self.on_auth_result(&packet),
            (state, event) => Err(Error::protocol(
                ProtocolErrorKind::InvalidHandshake,
                format!("unexpected {} in state {state:?}", event_name(&event)),
            )),
        }
    }

    fn on_greeting(&mut self, packet: &Packet) -> Result<HandshakeAction> {
        self.check_sequence(packet)?;

        if packet.first_byte() == Some(0xFF) {
            // Refused before the greeting (too many connections, host blocked).
            let err = PacketReader::new(&packet.payload)
                .parse_err_packet(CapabilityFlags::empty())
                .ok_or_else(|| invalid_response("truncated ERR packet", &packet.payload))?;
            return Err(Error::Server(err));
        }

        let handshake = Handshake::parse(&packet.payload)?;
        tracing::debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            auth_plugin = ?handshake.auth_plugin,
            "received server greeting"
        );

        let server_ssl = handshake.capabilities.contains(CapabilityFlags::SSL);
        let use_tls = self.decide_tls(server_ssl)?;

        let mut client_flags = self.options.client_flags;
        if use_tls {
            client_flags.insert(CapabilityFlags::SSL);
        }
        self.flags = client_flags & handshake.capabilities;
        if !self.flags.contains(CapabilityFlags::PROTOCOL_41) {
            return Err(Error::protocol(
                ProtocolErrorKind::InvalidHandshake,
                "server does not support the 4.1 protocol",
            ));
        }

        let next = packet.next_sequence_id();
        self.handshake = Some(handshake);

        if use_tls {
            self.state = HandshakeState::TlsUpgradeRequested;
            self.pending_sequence = next.wrapping_add(1);
            return Ok(HandshakeAction::UpgradeTls {
                ssl_request: ssl_request(
                    self.flags,
                    self.options.max_packet_size,
                    self.collation(),
                ),
                sequence_id: next,
            });
        }

        Ok(self.send_response(next))
    }

    fn decide_tls(&self, server_ssl: bool) -> Result<bool> {
        let mode = self.options.ssl_mode;
        if !mode.should_try_ssl() {
            return Ok(false);
        }
        if server_ssl && self.options.tls_available {
            return Ok(true);
        }

        let reason = if server_ssl {
            "TLS support is not available in this client"
        } else {
            "server does not support SSL"
        };
        if mode.is_required() {
            return Err(Error::connection(ConnectionErrorKind::Ssl, reason));
        }
        tracing::warn!(reason, "falling back to an unencrypted connection");
        Ok(false)
    }

    fn collation(&self) -> u8 {
        self.options
            .collation
            .or_else(|| self.handshake.as_ref().map(|h| h.collation))
            .unwrap_or_default()
    }

    fn send_response(&mut self, sequence_id: u8) -> HandshakeAction {
        let seed = self
            .handshake
            .as_ref()
            .map(|h| h.seed.as_slice())
            .unwrap_or_default();
        let password = self.options.password.as_deref().unwrap_or_default();
        let scramble = if self.flags.contains(CapabilityFlags::SECURE_CONNECTION) {
            auth::native_password_response(password, seed)
        } else {
            Vec::new()
        };

        let payload = HandshakeResponse {
            flags: self.flags,
            max_packet_size: self.options.max_packet_size,
            collation: self.collation(),
            user: &self.options.user,
            auth_response: &scramble,
            database: self.options.database.as_deref(),
            auth_plugin: plugins::MYSQL_NATIVE_PASSWORD,
        }
        .encode();

        self.state = HandshakeState::ResponseSent;
        self.expected_sequence = sequence_id.wrapping_add(1);
        HandshakeAction::Send {
            payload,
            sequence_id,
        }
    }

    fn on_auth_result(&mut self, packet: &Packet) -> Result<HandshakeAction> {
        self.check_sequence(packet)?;
        let payload = &packet.payload;

        match payload.first() {
            None => Err(invalid_response("empty authentication result", payload)),
            Some(0xFF) => {
                let err = PacketReader::new(payload)
                    .parse_err_packet(self.flags)
                    .ok_or_else(|| invalid_response("truncated ERR packet", payload))?;
                tracing::debug!(code = err.code, "authentication rejected");
                Err(Error::Server(err))
            }
            Some(0xFE) if payload.len() == 1 => Err(invalid_response(
                "auth switch request without a mechanism",
                payload,
            )),
            Some(0xFE) => self.on_auth_switch(packet),
            Some(_) => {
                let ok = PacketReader::new(payload)
                    .parse_ok_packet(self.flags)
                    .unwrap_or_default();
                self.state = HandshakeState::Authenticated;
                let handshake = self.handshake.clone().ok_or_else(|| {
                    Error::protocol(ProtocolErrorKind::InvalidHandshake, "no greeting received")
                })?;
                tracing::debug!(tls = self.tls, "authenticated");
                Ok(HandshakeAction::Authenticated(Box::new(Session {
                    handshake,
                    flags: self.flags,
                    ok,
                    tls: self.tls,
                })))
            }
        }
    }

    fn on_auth_switch(&mut self, packet: &Packet) -> Result<HandshakeAction> {
        let mut reader = PacketReader::new(&packet.payload[1..]);
        let plugin = reader.read_null_string();
        let data = reader.read_rest();
        let seed = data.strip_suffix(&[0]).unwrap_or(data);
        let password = self.options.password.as_deref().unwrap_or_default();

        tracing::debug!(plugin = %plugin, "auth switch requested");
        let response = match plugin.as_str() {
            plugins::MYSQL_NATIVE_PASSWORD => auth::native_password_response(password, seed),
            plugins::MYSQL_CLEAR_PASSWORD => {
                if !self.tls && !self.options.allow_cleartext_password {
                    return Err(Error::connection(
                        ConnectionErrorKind::Authentication,
                        "server asked for the clear text password on an unencrypted connection",
                    ));
                }
                auth::clear_password_response(password)
            }
            other => {
                return Err(Error::protocol(
                    ProtocolErrorKind::InvalidHandshake,
                    format!("unsupported authentication mechanism '{other}'"),
                ));
            }
        };

        if let Some(handshake) = self.handshake.as_mut() {
            handshake.auth_plugin = Some(plugin);
            handshake.seed = seed.to_vec();
        }

        let sequence_id = packet.next_sequence_id();
        self.state = HandshakeState::AwaitingAuthResult;
        self.expected_sequence = sequence_id.wrapping_add(1);
        Ok(HandshakeAction::Send {
            payload: response,
            sequence_id,
        })
    }

    fn check_sequence(&self, packet: &Packet) -> Result<()> {
        if packet.sequence_id != self.expected_sequence {
            return Err(Error::protocol(
                ProtocolErrorKind::InvalidPacket,
                format!(
                    "packet sequence id {} out of order, expected {}",
                    packet.sequence_id, self.expected_sequence
                ),
            ));
        }
        Ok(())
    }
}

fn event_name(event: &HandshakeEvent) -> &'static str {
    match event {
        HandshakeEvent::PacketReceived(_) => "packet",
        HandshakeEvent::TlsEstablished => "TLS completion",
        HandshakeEvent::IoError(_) => "I/O error",
        HandshakeEvent::Closed => "close",
    }
}
