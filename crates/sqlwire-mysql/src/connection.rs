//! Async MySQL connection over tokio.
//!
//! The connection owns its transport, a [`PacketParser`] for inbound
//! bytes and a reusable scratch buffer for outbound frames. The connection
//! phase is delegated to [`HandshakeMachine`]; this module only moves
//! bytes and carries out the actions the machine asks for.
//!
//! Every command starts a new exchange at sequence id 0. Replies must
//! continue the sequence; anything else is a protocol error. Protocol and
//! I/O errors are fatal and close the connection. Server `ERR` replies to
//! a command are not: the connection stays usable.
//!
//! Dropping a command future after the command was written leaves its
//! reply unread. The connection then reports [`MySqlConnection::is_closed`]
//! and the next command closes it instead of reading the stale reply.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolErrorKind};
use sqlwire_core::{ColumnInfo, Error, Result, Row};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::MySqlConfig;
use crate::handshake::Handshake;
use crate::protocol::{
    CapabilityFlags, Command, MAX_PACKET_SIZE, OkPacket, Packet, PacketParser, PacketReader,
    PacketWriter, Response, frame_into, invalid_response, server_status,
};
use crate::state_machine::{HandshakeAction, HandshakeEvent, HandshakeMachine, HandshakeOptions};
use crate::tls::{BoxedStream, TlsUpgrade};
use crate::types::{ColumnDef, decode_text_row};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, greeting not yet read
    Unauthenticated,
    /// Greeting and credentials being exchanged
    Handshaking,
    /// TLS handshake in progress
    TlsUpgrading,
    /// Ready for commands
    Authenticated,
    /// Closed by the client or after a fatal error
    Closed,
}

/// A single authenticated MySQL session.
pub struct MySqlConnection {
    stream: Option<BoxedStream>,
    state: ConnectionState,
    parser: PacketParser,
    /// Packets decoded ahead of the one being handled
    pending: VecDeque<Packet>,
    read_buf: Box<[u8]>,
    write_buf: Vec<u8>,
    /// Sequence id the next inbound reply must carry
    sequence_id: u8,
    /// A command was written and its reply not fully read
    in_flight: bool,
    handshake: Option<Handshake>,
    flags: CapabilityFlags,
    tls: bool,
    status_flags: u16,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    config: MySqlConfig,
}

impl fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect and authenticate.
    ///
    /// With the `tls` feature and an SSL mode other than `Disable`, the
    /// stream is upgraded with rustls when the server supports it.
    #[tracing::instrument(level = "debug", skip_all, fields(host = %config.host, port = config.port))]
    pub async fn connect(config: MySqlConfig) -> Result<Self> {
        let upgrader = default_upgrader(&config)?;
        Self::establish(config, upgrader.as_deref()).await
    }

    /// Connect and authenticate, using `upgrader` for the TLS step.
    #[tracing::instrument(level = "debug", skip_all, fields(host = %config.host, port = config.port))]
    pub async fn connect_with_tls(config: MySqlConfig, upgrader: &dyn TlsUpgrade) -> Result<Self> {
        Self::establish(config, Some(upgrader)).await
    }

    /// Run the connection phase over an already open transport.
    pub async fn connect_stream(
        stream: BoxedStream,
        config: MySqlConfig,
        upgrader: Option<&dyn TlsUpgrade>,
    ) -> Result<Self> {
        config.validate()?;
        let timeout = config.connect_timeout;
        let mut conn = Self::new(stream, config);
        let outcome = tokio::time::timeout(timeout, conn.authenticate(upgrader)).await;
        match outcome {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(e)) => {
                conn.abort(&e);
                Err(e)
            }
            Err(_) => {
                conn.abort(&Error::Timeout);
                Err(Error::Timeout)
            }
        }
    }

    async fn establish(config: MySqlConfig, upgrader: Option<&dyn TlsUpgrade>) -> Result<Self> {
        config.validate()?;
        let stream = tokio::time::timeout(config.connect_timeout, dial(&config))
            .await
            .map_err(|_| Error::Timeout)??;
        Self::connect_stream(Box::new(stream), config, upgrader).await
    }

    fn new(stream: BoxedStream, config: MySqlConfig) -> Self {
        Self {
            stream: Some(stream),
            state: ConnectionState::Unauthenticated,
            parser: PacketParser::new(),
            pending: VecDeque::new(),
            read_buf: vec![0; config.read_buffer_size].into_boxed_slice(),
            write_buf: Vec::new(),
            sequence_id: 0,
            in_flight: false,
            handshake: None,
            flags: CapabilityFlags::empty(),
            tls: false,
            status_flags: 0,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once authenticated, not closed and not mid-command.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Authenticated && !self.in_flight
    }

    /// True once closed, or when a command was abandoned before its reply
    /// was read. Such a connection is out of step with the server and
    /// will refuse further commands.
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed || self.in_flight
    }

    /// Server thread id.
    pub fn connection_id(&self) -> u32 {
        self.handshake.as_ref().map_or(0, |h| h.connection_id)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.handshake.as_ref().map(|h| h.server_version.as_str())
    }

    /// Capabilities negotiated during the handshake.
    pub fn capabilities(&self) -> CapabilityFlags {
        self.flags
    }

    /// Whether the transport is encrypted.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    async fn authenticate(&mut self, upgrader: Option<&dyn TlsUpgrade>) -> Result<()> {
        self.state = ConnectionState::Handshaking;
        let mut machine = HandshakeMachine::new(HandshakeOptions {
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            database: self.config.database.clone(),
            client_flags: self.config.capability_flags(),
            collation: self.config.collation,
            max_packet_size: self.config.max_packet_size,
            ssl_mode: self.config.ssl_mode,
            tls_available: upgrader.is_some(),
            allow_cleartext_password: self.config.allow_cleartext_password,
        });

        let mut event = self.next_event().await?;
        loop {
            match machine.step(event)? {
                HandshakeAction::Send {
                    payload,
                    sequence_id,
                } => {
                    self.write_packet(&payload, sequence_id).await?;
                    event = self.next_event().await?;
                }
                HandshakeAction::UpgradeTls {
                    ssl_request,
                    sequence_id,
                } => {
                    self.write_packet(&ssl_request, sequence_id).await?;
                    let upgrader = upgrader.ok_or_else(|| {
                        Error::connection(ConnectionErrorKind::Ssl, "no TLS upgrader available")
                    })?;
                    self.upgrade(upgrader).await?;
                    event = HandshakeEvent::TlsEstablished;
                }
                HandshakeAction::Authenticated(session) => {
                    self.flags = session.flags;
                    self.tls = session.tls;
                    self.status_flags = session.ok.status_flags;
                    self.warnings = session.ok.warnings;
                    self.handshake = Some(session.handshake);
                    self.state = ConnectionState::Authenticated;
                    tracing::info!(
                        connection_id = self.connection_id(),
                        server_version = self.server_version().unwrap_or_default(),
                        tls = self.tls,
                        "connected"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Read the next packet as a handshake event.
    async fn next_event(&mut self) -> Result<HandshakeEvent> {
        match self.read_packet().await {
            Ok(packet) => Ok(HandshakeEvent::PacketReceived(packet)),
            Err(Error::Io(e)) => Ok(HandshakeEvent::IoError(e)),
            Err(Error::Connection(c)) if c.kind == ConnectionErrorKind::Disconnected => {
                Ok(HandshakeEvent::Closed)
            }
            Err(e) => Err(e),
        }
    }

    async fn upgrade(&mut self, upgrader: &dyn TlsUpgrade) -> Result<()> {
        if !self.pending.is_empty() || !self.parser.is_idle() {
            return Err(Error::protocol(
                ProtocolErrorKind::InvalidPacket,
                "unexpected data before TLS upgrade",
            ));
        }
        self.state = ConnectionState::TlsUpgrading;
        let stream = self.stream.take().ok_or_else(Error::closed)?;
        let stream = upgrader.upgrade(stream, &self.config.host).await?;
        self.stream = Some(stream);
        self.state = ConnectionState::Handshaking;
        Ok(())
    }

    /// Next complete packet, reading from the socket as needed.
    async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(packet);
            }
            let stream = self.stream.as_mut().ok_or_else(Error::closed)?;
            let n = stream.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::connection(
                    ConnectionErrorKind::Disconnected,
                    "server closed the connection",
                ));
            }
            let packets = self.parser.feed(&self.read_buf[..n])?;
            self.pending.extend(packets);
        }
    }

    /// Next packet of the current exchange, with its sequence id checked.
    async fn read_reply(&mut self) -> Result<Packet> {
        let packet = self.read_packet().await?;
        if packet.sequence_id != self.sequence_id {
            return Err(Error::Protocol(sqlwire_core::ProtocolError {
                kind: ProtocolErrorKind::InvalidPacket,
                message: format!(
                    "packet sequence id {} out of order, expected {}",
                    packet.sequence_id, self.sequence_id
                ),
                raw_data: Some(packet.payload),
                source: None,
            }));
        }
        self.sequence_id = packet.next_sequence_id();
        Ok(packet)
    }

    async fn write_packet(&mut self, payload: &[u8], sequence_id: u8) -> Result<()> {
        let next = frame_into(&mut self.write_buf, payload, sequence_id, MAX_PACKET_SIZE);
        let stream = self.stream.as_mut().ok_or_else(Error::closed)?;
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;
        self.sequence_id = next;
        Ok(())
    }

    async fn send_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Authenticated => {}
            ConnectionState::Closed => return Err(Error::closed()),
            state => {
                return Err(Error::connection(
                    ConnectionErrorKind::Disconnected,
                    format!("connection not ready for commands ({state:?})"),
                ));
            }
        }
        if self.in_flight {
            return Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "previous command was cancelled before its reply was read",
            ));
        }
        if !self.pending.is_empty() || !self.parser.is_idle() {
            return Err(Error::protocol(
                ProtocolErrorKind::InvalidPacket,
                "unsolicited data from server",
            ));
        }

        let payload = PacketWriter::command(command, body).into_bytes();
        tracing::trace!(?command, len = payload.len(), "sending command");
        self.in_flight = true;
        self.write_packet(&payload, 0).await
    }

    /// Close the connection after a fatal error.
    fn abort(&mut self, cause: &Error) {
        if self.state != ConnectionState::Closed {
            tracing::warn!(
                error = %cause,
                connection_id = self.connection_id(),
                "closing connection after fatal error"
            );
        }
        self.stream = None;
        self.in_flight = false;
        self.release_buffers();
        self.state = ConnectionState::Closed;
    }

    fn release_buffers(&mut self) {
        self.pending.clear();
        self.parser.reset();
        self.read_buf = Box::default();
        self.write_buf = Vec::new();
    }

    /// Finish a command exchange. Success and server `ERR` replies end it
    /// cleanly; anything else may leave reply packets unread, so the
    /// connection is closed.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) | Err(Error::Server(_)) => self.in_flight = false,
            Err(e) if e.is_fatal() || self.in_flight => self.abort(e),
            Err(_) => {}
        }
        result
    }

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.status_flags = ok.status_flags;
        self.warnings = ok.warnings;
    }

    /// Run a text query and collect its rows.
    ///
    /// Statements that return no result set yield an empty vector;
    /// [`affected_rows`](Self::affected_rows) and
    /// [`last_insert_id`](Self::last_insert_id) are updated from the OK.
    #[tracing::instrument(level = "debug", skip(self), fields(connection_id = self.connection_id()))]
    pub async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        let result = self.run_query(sql).await;
        self.guard(result)
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.query(sql).await?;
        Ok(self.affected_rows)
    }

    /// Check that the server answers.
    pub async fn ping(&mut self) -> Result<()> {
        let result = self.simple_command(Command::Ping, &[]).await;
        self.guard(result)
    }

    /// Change the default database.
    pub async fn select_db(&mut self, database: &str) -> Result<()> {
        let result = self.simple_command(Command::InitDb, database.as_bytes()).await;
        self.guard(result)?;
        self.config.database = Some(database.to_string());
        Ok(())
    }

    /// Send `COM_QUIT` and close the transport. Safe to call repeatedly.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        let send_quit = self.state == ConnectionState::Authenticated;
        let stream = self.stream.take();
        self.state = ConnectionState::Closed;
        self.in_flight = false;

        if let Some(mut stream) = stream {
            if send_quit {
                frame_into(&mut self.write_buf, &[Command::Quit as u8], 0, MAX_PACKET_SIZE);
                if let Err(e) = stream.write_all(&self.write_buf).await {
                    tracing::debug!(error = %e, "failed to send COM_QUIT");
                }
            }
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "socket shutdown failed");
            }
        }
        self.release_buffers();
        tracing::debug!(connection_id = self.connection_id(), "connection closed");
        Ok(())
    }

    async fn simple_command(&mut self, command: Command, body: &[u8]) -> Result<()> {
        self.send_command(command, body).await?;
        let reply = self.read_reply().await?;
        match Response::parse(&reply.payload, self.flags)? {
            Response::Ok(ok) => {
                self.apply_ok(&ok);
                Ok(())
            }
            Response::Err(err) => Err(Error::Server(err)),
            Response::Eof(_) => Err(invalid_response(
                format!("unexpected EOF in reply to {command:?}"),
                &reply.payload,
            )),
        }
    }

    async fn run_query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.send_command(Command::Query, sql.as_bytes()).await?;
        let first = self.read_reply().await?;

        match first.first_byte() {
            Some(0x00 | 0xFF) => match Response::parse(&first.payload, self.flags)? {
                Response::Ok(ok) => {
                    self.apply_ok(&ok);
                    Ok(Vec::new())
                }
                Response::Err(err) => Err(Error::Server(err)),
                Response::Eof(_) => Err(invalid_response("unexpected EOF", &first.payload)),
            },
            _ => self.read_result_set(&first.payload).await,
        }
    }

    async fn read_result_set(&mut self, header: &[u8]) -> Result<Vec<Row>> {
        let column_count = PacketReader::new(header)
            .read_lenenc_int()
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid_response("invalid column count", header))?;

        let mut columns = Vec::new();
        for _ in 0..column_count {
            let packet = self.read_reply().await?;
            columns.push(ColumnDef::parse(&packet.payload)?);
        }

        let deprecate_eof = self.flags.contains(CapabilityFlags::DEPRECATE_EOF);
        if !deprecate_eof {
            let packet = self.read_reply().await?;
            if !is_terminator(&packet.payload, false) {
                return Err(invalid_response(
                    "expected EOF after column definitions",
                    &packet.payload,
                ));
            }
        }

        let info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| c.name.clone()).collect(),
        ));
        let mut rows = Vec::new();
        loop {
            let packet = self.read_reply().await?;
            if packet.first_byte() == Some(0xFF) {
                let err = PacketReader::new(&packet.payload)
                    .parse_err_packet(self.flags)
                    .ok_or_else(|| invalid_response("truncated ERR packet", &packet.payload))?;
                return Err(Error::Server(err));
            }
            if is_terminator(&packet.payload, deprecate_eof) {
                match Response::parse(&packet.payload, self.flags)? {
                    Response::Eof(eof) => {
                        self.status_flags = eof.status_flags;
                        self.warnings = eof.warnings;
                    }
                    Response::Ok(ok) => {
                        self.status_flags = ok.status_flags;
                        self.warnings = ok.warnings;
                    }
                    Response::Err(err) => return Err(Error::Server(err)),
                }
                self.affected_rows = 0;
                break;
            }
            rows.push(decode_text_row(&packet.payload, &columns, &info)?);
        }

        tracing::debug!(rows = rows.len(), columns = columns.len(), "result set read");
        Ok(rows)
    }
}

/// End-of-rows marker: a short `0xFE` EOF, or with `DEPRECATE_EOF` an OK
/// packet under the `0xFE` header. Rows never start with `0xFE` unless
/// their first value is at least 16 MiB.
fn is_terminator(payload: &[u8], deprecate_eof: bool) -> bool {
    payload.first() == Some(&0xFE)
        && (payload.len() < 9 || (deprecate_eof && payload.len() < MAX_PACKET_SIZE))
}

async fn dial(config: &MySqlConfig) -> Result<TcpStream> {
    let addr = config.socket_addr();
    let addrs = tokio::net::lookup_host(&addr).await.map_err(|e| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("failed to resolve {addr}: {e}"),
            source: Some(Box::new(e)),
        })
    })?;

    let mut last_error = None;
    for socket_addr in addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                }
                tracing::debug!(%socket_addr, "TCP connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%socket_addr, error = %e, "TCP connect failed");
                last_error = Some(e);
            }
        }
    }

    Err(Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: match &last_error {
            Some(e) => format!("failed to connect to {addr}: {e}"),
            None => format!("no addresses found for {addr}"),
        },
        source: last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    }))
}

#[cfg(feature = "tls")]
fn default_upgrader(config: &MySqlConfig) -> Result<Option<Box<dyn TlsUpgrade>>> {
    if !config.ssl_mode.should_try_ssl() {
        return Ok(None);
    }
    let upgrader = crate::tls::RustlsUpgrade::new(&config.tls, config.ssl_mode)?;
    Ok(Some(Box::new(upgrader)))
}

#[cfg(not(feature = "tls"))]
fn default_upgrader(config: &MySqlConfig) -> Result<Option<Box<dyn TlsUpgrade>>> {
    if config.ssl_mode.is_required() {
        return Err(Error::config(
            "ssl mode requires TLS but the 'tls' feature is disabled",
        ));
    }
    Ok(None)
}

impl sqlwire_core::Connection for MySqlConnection {
    fn query(&mut self, sql: &str) -> impl Future<Output = Result<Vec<Row>>> + Send {
        MySqlConnection::query(self, sql)
    }

    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<u64>> + Send {
        MySqlConnection::execute(self, sql)
    }

    fn ping(&mut self) -> impl Future<Output = Result<()>> + Send {
        MySqlConnection::ping(self)
    }

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send {
        MySqlConnection::close(self)
    }

    fn is_closed(&self) -> bool {
        MySqlConnection::is_closed(self)
    }
}

/// Opens [`MySqlConnection`]s for a pool.
#[derive(Clone)]
pub struct MySqlConnectionFactory {
    config: MySqlConfig,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl fmt::Debug for MySqlConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnectionFactory")
            .field("config", &self.config)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl MySqlConnectionFactory {
    pub fn new(config: MySqlConfig) -> Self {
        Self { config, tls: None }
    }

    /// Use `upgrader` instead of the built-in TLS support.
    pub fn with_tls(mut self, upgrader: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(upgrader);
        self
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }
}

impl sqlwire_core::ConnectionFactory for MySqlConnectionFactory {
    type Connection = MySqlConnection;

    fn connect(&self) -> impl Future<Output = Result<MySqlConnection>> + Send {
        async move {
            match &self.tls {
                Some(upgrader) => {
                    MySqlConnection::connect_with_tls(self.config.clone(), upgrader.as_ref()).await
                }
                None => MySqlConnection::connect(self.config.clone()).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::plugins;
    use crate::config::SslMode;
    use crate::handshake::tests::{greeting, server_caps};
    use crate::tls::{BoxFuture, tls_error};
    use crate::types::FieldType;
    use crate::types::tests::column_packet;
    use sqlwire_core::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Scripted server end of a duplex pipe.
    struct Peer {
        io: DuplexStream,
        parser: PacketParser,
        pending: VecDeque<Packet>,
    }

    impl Peer {
        async fn send(&mut self, seq: u8, payload: &[u8]) {
            let mut out = Vec::new();
            frame_into(&mut out, payload, seq, MAX_PACKET_SIZE);
            self.io.write_all(&out).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Packet> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(p) = self.pending.pop_front() {
                    return Some(p);
                }
                let n = self.io.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.pending.extend(self.parser.feed(&buf[..n]).unwrap());
            }
        }
    }

    fn ok(affected: u8, insert_id: u8) -> Vec<u8> {
        vec![0x00, affected, insert_id, 0x02, 0x00, 0x00, 0x00]
    }

    async fn connected() -> (MySqlConnection, Peer) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut peer = Peer {
            io: server,
            parser: PacketParser::new(),
            pending: VecDeque::new(),
        };
        let config = MySqlConfig::new().user("app").password("secret");

        let server_task = tokio::spawn(async move {
            peer.send(0, &greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD))
                .await;
            let response = peer.recv().await.unwrap();
            assert_eq!(response.sequence_id, 1);
            peer.send(2, &ok(0, 0)).await;
            peer
        });

        let conn = MySqlConnection::connect_stream(Box::new(client), config, None)
            .await
            .unwrap();
        (conn, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn test_connect_over_stream() {
        let (conn, _peer) = connected().await;
        assert!(conn.is_ready());
        assert_eq!(conn.connection_id(), 42);
        assert_eq!(conn.server_version(), Some("8.0.36"));
        assert!(!conn.is_tls());
        assert!(conn.capabilities().contains(CapabilityFlags::PROTOCOL_41));
    }

    #[tokio::test]
    async fn test_execute_resets_sequence() {
        let (mut conn, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            for i in 1..=2u8 {
                let cmd = peer.recv().await.unwrap();
                assert_eq!(cmd.sequence_id, 0);
                assert_eq!(cmd.payload[0], Command::Query as u8);
                peer.send(1, &ok(i, 9)).await;
            }
            peer
        });

        assert_eq!(conn.execute("UPDATE t SET a = 1").await.unwrap(), 1);
        assert_eq!(conn.execute("UPDATE t SET a = 2").await.unwrap(), 2);
        assert_eq!(conn.last_insert_id(), 9);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_query_rows() {
        let (mut conn, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            peer.recv().await.unwrap();
            peer.send(1, &[2]).await;
            peer.send(2, &column_packet("id", FieldType::Long, 0, 63))
                .await;
            peer.send(3, &column_packet("name", FieldType::VarString, 0, 255))
                .await;
            peer.send(4, &[0xFE, 0, 0, 2, 0]).await;

            let mut row = PacketWriter::new();
            row.write_lenenc_string("1");
            row.write_lenenc_string("alice");
            peer.send(5, row.as_bytes()).await;
            peer.send(6, &[0xFE, 0, 0, 2, 0]).await;
            peer
        });

        let rows = conn.query("SELECT id, name FROM users").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::Int(1)));
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "alice");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let (mut conn, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            peer.recv().await.unwrap();
            let mut err = vec![0xFF, 0x26, 0x04, b'#'];
            err.extend_from_slice(b"23000Duplicate entry '1' for key 'PRIMARY'");
            peer.send(1, &err).await;

            let ping = peer.recv().await.unwrap();
            assert_eq!(ping.payload, vec![Command::Ping as u8]);
            peer.send(1, &ok(0, 0)).await;
            peer
        });

        let err = conn.execute("INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(err.server_error().unwrap().is_duplicate_entry());
        assert!(conn.is_ready());
        conn.ping().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_reply_closes() {
        let (mut conn, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            peer.recv().await.unwrap();
            peer.send(7, &ok(0, 0)).await;
            peer
        });

        let err = conn.ping().await.unwrap_err();
        assert_eq!(err.protocol_kind(), Some(ProtocolErrorKind::InvalidPacket));
        assert!(conn.is_closed());
        let err = conn.ping().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Disconnected
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_sends_quit_once() {
        let (mut conn, mut peer) = connected().await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());

        let quit = peer.recv().await.unwrap();
        assert_eq!(quit.sequence_id, 0);
        assert_eq!(quit.payload, vec![Command::Quit as u8]);
        assert!(peer.recv().await.is_none());

        assert!(conn.query("SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn test_auth_failure_closes() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut peer = Peer {
            io: server,
            parser: PacketParser::new(),
            pending: VecDeque::new(),
        };
        let server_task = tokio::spawn(async move {
            peer.send(0, &greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD))
                .await;
            peer.recv().await.unwrap();
            let mut err = vec![0xFF, 0x15, 0x04, b'#'];
            err.extend_from_slice(b"28000Access denied");
            peer.send(2, &err).await;
            peer.recv().await
        });

        let config = MySqlConfig::new().user("app").password("wrong");
        let err = MySqlConnection::connect_stream(Box::new(client), config, None)
            .await
            .unwrap_err();
        assert!(err.is_invalid_credentials());
        // Dropped transport: the peer sees EOF.
        assert!(server_task.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let config = MySqlConfig::new()
            .user("app")
            .connect_timeout(std::time::Duration::from_millis(20));
        let err = MySqlConnection::connect_stream(Box::new(client), config, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_command_breaks_connection() {
        let (mut conn, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            let cmd = peer.recv().await.unwrap();
            assert_eq!(&cmd.payload[1..], b"UPDATE t SET a = 1");
            // No reply. The next thing seen must be the client hanging up,
            // not a second command.
            peer.recv().await
        });

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), conn.execute("UPDATE t SET a = 1"))
                .await;
        assert!(cancelled.is_err());
        assert!(conn.is_closed());
        assert!(!conn.is_ready());

        let err = conn.execute("UPDATE t SET a = 2").await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(server.await.unwrap().is_none());
    }

    /// Hands the stream back unchanged and records the host it was given.
    #[derive(Default)]
    struct PassThrough {
        hosts: Arc<Mutex<Vec<String>>>,
    }

    impl TlsUpgrade for PassThrough {
        fn upgrade<'a>(
            &'a self,
            stream: BoxedStream,
            host: &'a str,
        ) -> BoxFuture<'a, Result<BoxedStream>> {
            self.hosts.lock().unwrap().push(host.to_string());
            Box::pin(async move { Ok(stream) })
        }
    }

    struct RefuseTls;

    impl TlsUpgrade for RefuseTls {
        fn upgrade<'a>(
            &'a self,
            stream: BoxedStream,
            _host: &'a str,
        ) -> BoxFuture<'a, Result<BoxedStream>> {
            Box::pin(async move {
                drop(stream);
                Err(tls_error("certificate rejected", None))
            })
        }
    }

    fn tls_peer() -> (BoxedStream, Peer) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let peer = Peer {
            io: server,
            parser: PacketParser::new(),
            pending: VecDeque::new(),
        };
        (Box::new(client), peer)
    }

    fn tls_config() -> MySqlConfig {
        MySqlConfig::new()
            .host("db.internal")
            .user("app")
            .password("secret")
            .ssl_mode(SslMode::Required)
    }

    #[tokio::test]
    async fn test_tls_upgrade_continues_sequence() {
        let (client, mut peer) = tls_peer();
        let server = tokio::spawn(async move {
            peer.send(0, &greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD))
                .await;

            let ssl_request = peer.recv().await.unwrap();
            assert_eq!(ssl_request.sequence_id, 1);
            assert_eq!(ssl_request.payload.len(), 32);
            let flags = CapabilityFlags::from_bits(u32::from_le_bytes(
                ssl_request.payload[..4].try_into().unwrap(),
            ));
            assert!(flags.contains(CapabilityFlags::SSL));
            assert!(flags.contains(CapabilityFlags::PROTOCOL_41));

            let response = peer.recv().await.unwrap();
            assert_eq!(response.sequence_id, 2);
            assert!(response.payload.len() > 32);
            peer.send(3, &ok(0, 0)).await;
            peer
        });

        let upgrader = PassThrough::default();
        let conn = MySqlConnection::connect_stream(client, tls_config(), Some(&upgrader))
            .await
            .unwrap();
        assert!(conn.is_ready());
        assert!(conn.is_tls());
        assert!(conn.capabilities().contains(CapabilityFlags::SSL));
        assert_eq!(*upgrader.hosts.lock().unwrap(), vec!["db.internal".to_string()]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_refusal_closes() {
        let (client, mut peer) = tls_peer();
        let server = tokio::spawn(async move {
            peer.send(0, &greeting(server_caps(), plugins::MYSQL_NATIVE_PASSWORD))
                .await;
            let ssl_request = peer.recv().await.unwrap();
            assert_eq!(ssl_request.sequence_id, 1);
            // The refused stream is dropped: no handshake response follows.
            peer.recv().await
        });

        let err = MySqlConnection::connect_stream(client, tls_config(), Some(&RefuseTls))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Ssl
        ));
        assert!(err.is_connection_error());
        assert!(server.await.unwrap().is_none());
    }

    #[test]
    fn test_terminator_detection() {
        assert!(is_terminator(&[0xFE, 0, 0, 2, 0], false));
        assert!(!is_terminator(&[0xFE; 12], false));
        assert!(is_terminator(&[0xFE; 12], true));
        assert!(!is_terminator(&[0x01, b'x'], true));
    }
}
