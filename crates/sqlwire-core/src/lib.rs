//! Core types and traits for sqlwire.
//!
//! This crate provides the pieces shared by the protocol driver and the pool:
//!
//! - `Error` taxonomy covering framing, handshake, server and pool failures
//! - `Value` and `Row` for decoded result sets
//! - `Connection` and `ConnectionFactory` traits the pool is generic over

pub mod connection;
pub mod error;
pub mod row;
pub mod value;

pub use connection::{Connection, ConnectionFactory};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind,
    ProtocolError, ProtocolErrorKind, Result, ServerError, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
