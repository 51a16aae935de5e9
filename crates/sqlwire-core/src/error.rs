//! Error types for sqlwire operations.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authentication, disconnect)
    Connection(ConnectionError),
    /// Wire-level protocol violations
    Protocol(ProtocolError),
    /// Error packet reported by the server
    Server(ServerError),
    /// Type conversion errors when reading row values
    Type(TypeError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the TCP connection
    Connect,
    /// Credentials were rejected, or the client refused to send them
    Authentication,
    /// The connection is closed (explicitly, or after a fatal error)
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// DNS resolution failed
    DnsResolution,
}

/// A framing, handshake or response decoding failure.
///
/// Every protocol error is fatal to the connection that produced it.
#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Bad frame header, oversized length or out-of-order sequence id
    InvalidPacket,
    /// Unsupported protocol version, truncated greeting or unknown auth mechanism
    InvalidHandshake,
    /// Malformed OK/ERR/EOF or result set payload
    InvalidResponse,
}

/// An `ERR` packet sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// MySQL error number (e.g. 1045 for access denied)
    pub code: u16,
    /// Five character SQLSTATE, present when the 4.1 protocol is negotiated
    pub sql_state: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Server error codes that mean the supplied credentials were not accepted.
const ACCESS_DENIED_CODES: [u16; 3] = [
    1044, // ER_DBACCESS_DENIED_ERROR
    1045, // ER_ACCESS_DENIED_ERROR
    1698, // ER_ACCESS_DENIED_NO_PASSWORD_ERROR
];

impl Error {
    /// Shorthand for a protocol error of the given kind.
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            kind,
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Shorthand for a connection error of the given kind.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// The error returned by every operation on a closed connection.
    pub fn closed() -> Self {
        Self::connection(ConnectionErrorKind::Disconnected, "connection closed")
    }

    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (pool exhausted, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Does this error leave the connection that produced it unusable?
    ///
    /// Server `ERR` packets after authentication are not fatal: the
    /// connection is still in sync and can run the next command.
    pub fn is_fatal(&self) -> bool {
        self.is_connection_error() || matches!(self, Error::Timeout)
    }

    /// Were the credentials rejected?
    pub fn is_invalid_credentials(&self) -> bool {
        match self {
            Error::Connection(c) => c.kind == ConnectionErrorKind::Authentication,
            Error::Server(s) => ACCESS_DENIED_CODES.contains(&s.code),
            _ => false,
        }
    }

    /// Kind of protocol violation, if this is one.
    pub fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            Error::Protocol(p) => Some(p.kind),
            _ => None,
        }
    }

    /// The server error, if this error came from an `ERR` packet.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(s) => Some(s),
            _ => None,
        }
    }

    /// MySQL error number, if this error came from an `ERR` packet.
    pub fn server_code(&self) -> Option<u16> {
        self.server_error().map(|s| s.code)
    }

    /// Get SQLSTATE if available (e.g., "28000" for access denied)
    pub fn sqlstate(&self) -> Option<&str> {
        self.server_error().and_then(|s| s.sql_state.as_deref())
    }
}

impl ServerError {
    /// Is this a duplicate key violation?
    pub fn is_duplicate_entry(&self) -> bool {
        self.code == 1062
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Server(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Type(_) | Error::Timeout => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolErrorKind::InvalidPacket => "invalid packet",
            ProtocolErrorKind::InvalidHandshake => "invalid handshake",
            ProtocolErrorKind::InvalidResponse => "invalid response",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(state) = &self.sql_state {
            write!(f, "ERROR {} ({}): {}", self.code, state, self.message)
        } else {
            write!(f, "ERROR {}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for ServerError {}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;
