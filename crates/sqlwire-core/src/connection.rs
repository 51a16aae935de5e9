//! Database connection traits.
//!
//! - [`Connection`] - an authenticated session that runs one command at a time
//! - [`ConnectionFactory`] - how a pool opens new connections
//!
//! Connections take `&mut self` for every command: a session has a single
//! writer, and exclusive access is what the pool's reservation hands out.

use crate::error::Result;
use crate::row::Row;

/// An authenticated database session.
pub trait Connection: Send + 'static {
    /// Run a text query and collect every row.
    fn query(&mut self, sql: &str) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Run a statement and return the affected row count.
    fn execute(&mut self, sql: &str) -> impl Future<Output = Result<u64>> + Send;

    /// Check that the server still answers.
    fn ping(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Close the session. Calling this more than once is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// True once the connection has been closed or hit a fatal error.
    fn is_closed(&self) -> bool;
}

/// Opens new connections on demand.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;
}
