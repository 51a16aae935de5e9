//! MySQL client wire protocol for sqlwire.
//!
//! This crate implements the MySQL client/server protocol on top of
//! tokio. It provides:
//!
//! - Incremental packet parsing and frame serialization
//! - The v10 handshake with optional in-band TLS upgrade
//! - Authentication (`mysql_native_password`, `mysql_clear_password`)
//! - Text protocol queries, pings and database switching
//! - A [`ConnectionFactory`](sqlwire_core::ConnectionFactory) for `sqlwire-pool`
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Payloads of 16MB or more split over several frames
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config).await?;
//! let rows = conn.query("SELECT 1").await?;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod protocol;
pub mod state_machine;
pub mod tls;
pub mod types;

pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection, MySqlConnectionFactory};
pub use handshake::{Handshake, HandshakeResponse};
pub use protocol::{CapabilityFlags, Packet, PacketParser, frame_into};
pub use state_machine::{
    HandshakeAction, HandshakeEvent, HandshakeMachine, HandshakeOptions, HandshakeState, Session,
};
#[cfg(feature = "tls")]
pub use tls::RustlsUpgrade;
pub use tls::{BoxedStream, TlsUpgrade};
