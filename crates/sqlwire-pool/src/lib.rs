//! Connection pooling for sqlwire.
//!
//! A [`Pool`] lends out at most `max_connections` connections. Each one
//! lives in a slot that is either reserved by exactly one caller or idle.
//! Callers that find nothing idle and no spare capacity wait in a FIFO
//! queue, and a released connection goes straight to the oldest waiter
//! instead of back to the idle set, so a connection is never idle while
//! someone is waiting for one.
//!
//! Broken connections are evicted on release. Their capacity is passed to
//! the oldest waiter as a permit to open a replacement, so the pool grows
//! back instead of shrinking after failures.
//!
//! ```rust,ignore
//! let pool = Pool::new(MySqlConnectionFactory::new(config), PoolConfig::new(4))?;
//! let rows = pool
//!     .retain(|conn| Box::pin(async move { conn.query("SELECT 1").await }))
//!     .await?;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use sqlwire_core::error::PoolErrorKind;
use sqlwire_core::{Connection, ConnectionFactory, Error, Result};
use tokio::sync::oneshot;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections allowed
    pub max_connections: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Ping idle connections before giving them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            test_on_checkout: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, including ones being opened
    pub total_connections: usize,
    pub idle_connections: usize,
    /// Connections currently lent out
    pub active_connections: usize,
    /// Callers waiting in the queue
    pub pending_requests: usize,
    pub connections_created: u64,
    pub connections_evicted: u64,
}

type Conn<F> = <F as ConnectionFactory>::Connection;

/// What a caller is given: an idle connection, or the right to open one.
enum Grant<C> {
    Lease { slot: u64, conn: C },
    Create,
}

struct Slot<C> {
    id: u64,
    /// `None` while reserved
    conn: Option<C>,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

struct PoolState<C> {
    slots: Vec<Slot<C>>,
    /// Open connections plus connections being opened; never above the max
    live: usize,
    waiters: VecDeque<Waiter<C>>,
    next_id: u64,
    closed: bool,
    created: u64,
    evicted: u64,
}

impl<C> PoolState<C> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Give `grant` to the oldest waiter still listening, or park it.
    fn hand_off(&mut self, mut grant: Grant<C>) {
        if !self.closed {
            while let Some(waiter) = self.waiters.pop_front() {
                match waiter.tx.send(grant) {
                    Ok(()) => {
                        tracing::trace!(waiter = waiter.id, "handed off to waiter");
                        return;
                    }
                    Err(returned) => grant = returned,
                }
            }
        }

        match grant {
            Grant::Lease { slot, conn } => {
                let closed = self.closed;
                match self.slots.iter_mut().find(|s| s.id == slot) {
                    Some(s) if !closed => s.conn = Some(conn),
                    _ => self.evict(slot),
                }
            }
            Grant::Create => self.live -= 1,
        }
    }

    /// Forget a slot and pass its capacity on.
    fn evict(&mut self, slot: u64) {
        self.slots.retain(|s| s.id != slot);
        self.evicted += 1;
        self.release_capacity();
    }

    /// One live connection fewer; the oldest waiter may open a new one.
    fn release_capacity(&mut self) {
        self.live -= 1;
        if !self.closed && !self.waiters.is_empty() {
            self.live += 1;
            self.hand_off(Grant::Create);
        }
    }
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<Conn<F>>>,
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<Conn<F>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bounded pool of connections opened by `F`.
pub struct Pool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Step<C> {
    Ready(Grant<C>),
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::pool(
                PoolErrorKind::Config,
                "max_connections must be at least 1",
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                config,
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    live: 0,
                    waiters: VecDeque::new(),
                    next_id: 0,
                    closed: false,
                    created: 0,
                    evicted: 0,
                }),
            }),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let idle = state.slots.iter().filter(|s| s.conn.is_some()).count();
        PoolStats {
            total_connections: state.live,
            idle_connections: idle,
            active_connections: state.slots.len() - idle,
            pending_requests: state.waiters.len(),
            connections_created: state.created,
            connections_evicted: state.evicted,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Reserve a connection, run `work` on it and release it, whatever
    /// the outcome. Connection-level errors from `work` evict the
    /// connection instead of returning it to the pool.
    pub async fn retain<T, W>(&self, work: W) -> Result<T>
    where
        W: for<'c> FnOnce(&'c mut Conn<F>) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        let result = work(&mut *conn).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                conn.mark_broken();
            }
        }
        result
    }

    /// Reserve a connection until the returned guard is dropped.
    ///
    /// Waits at most `acquire_timeout`. Dropping the future while it waits
    /// gives up its place in the queue.
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        let timeout = self.shared.config.acquire_timeout;
        tokio::time::timeout(timeout, self.acquire_inner())
            .await
            .map_err(|_| {
                tracing::debug!(?timeout, "timed out waiting for a connection");
                Error::pool(
                    PoolErrorKind::Timeout,
                    format!("no connection available within {timeout:?}"),
                )
            })?
    }

    async fn acquire_inner(&self) -> Result<PooledConnection<F>> {
        loop {
            let step = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(pool_closed());
                }
                self.try_reserve(&mut state)
            };

            let grant = match step {
                Step::Ready(grant) => grant,
                Step::Wait(id, rx) => {
                    WaitEntry {
                        shared: &self.shared,
                        id,
                        rx,
                        done: false,
                    }
                    .wait()
                    .await?
                }
            };

            if let Some(conn) = self.redeem(grant).await? {
                return Ok(conn);
            }
        }
    }

    /// Reserve a connection without waiting.
    ///
    /// Fails with `Pool(Exhausted)` when nothing is idle, the pool is at
    /// capacity, or other callers are already queued.
    pub async fn try_acquire(&self) -> Result<PooledConnection<F>> {
        loop {
            let grant = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(pool_closed());
                }
                self.reserve_now(&mut state).ok_or_else(|| {
                    Error::pool(
                        PoolErrorKind::Exhausted,
                        format!(
                            "all {} connections are in use",
                            self.shared.config.max_connections
                        ),
                    )
                })?
            };

            if let Some(conn) = self.redeem(grant).await? {
                return Ok(conn);
            }
        }
    }

    /// Take an idle connection or spare capacity, unless someone is queued.
    fn reserve_now(&self, state: &mut PoolState<Conn<F>>) -> Option<Grant<Conn<F>>> {
        if !state.waiters.is_empty() {
            return None;
        }
        if let Some(slot) = state.slots.iter_mut().find(|s| s.conn.is_some()) {
            if let Some(conn) = slot.conn.take() {
                return Some(Grant::Lease { slot: slot.id, conn });
            }
        }
        if state.live < self.shared.config.max_connections {
            state.live += 1;
            return Some(Grant::Create);
        }
        None
    }

    fn try_reserve(&self, state: &mut PoolState<Conn<F>>) -> Step<Conn<F>> {
        if let Some(grant) = self.reserve_now(state) {
            return Step::Ready(grant);
        }

        let id = state.next_id();
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, tx });
        tracing::trace!(waiter = id, queued = state.waiters.len(), "waiting for a connection");
        Step::Wait(id, rx)
    }

    /// Turn a grant into a usable connection; `None` if a leased one
    /// turned out to be broken.
    async fn redeem(&self, grant: Grant<Conn<F>>) -> Result<Option<PooledConnection<F>>> {
        match grant {
            Grant::Lease { slot, conn } => Ok(self.check_out(slot, conn).await),
            Grant::Create => self.create().await.map(Some),
        }
    }

    /// Validate a leased connection; `None` if it had to be evicted.
    async fn check_out(&self, slot: u64, conn: Conn<F>) -> Option<PooledConnection<F>> {
        let mut guard = PooledConnection {
            conn: Some(conn),
            slot,
            broken: false,
            shared: Arc::clone(&self.shared),
        };
        if guard.is_closed() {
            guard.mark_broken();
            return None;
        }
        if self.shared.config.test_on_checkout {
            if let Err(e) = guard.ping().await {
                tracing::debug!(error = %e, slot, "connection failed checkout ping");
                guard.mark_broken();
                return None;
            }
        }
        Some(guard)
    }

    async fn create(&self) -> Result<PooledConnection<F>> {
        let mut permit = CreatePermit {
            shared: &self.shared,
            armed: true,
        };

        let mut conn = match self.shared.factory.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open pooled connection");
                return Err(e);
            }
        };

        let slot = {
            let mut state = self.shared.lock();
            if state.closed {
                None
            } else {
                permit.armed = false;
                let id = state.next_id();
                state.slots.push(Slot { id, conn: None });
                state.created += 1;
                tracing::debug!(slot = id, live = state.live, "opened pooled connection");
                Some(id)
            }
        };

        match slot {
            Some(slot) => Ok(PooledConnection {
                conn: Some(conn),
                slot,
                broken: false,
                shared: Arc::clone(&self.shared),
            }),
            None => {
                drop(permit);
                if let Err(e) = conn.close().await {
                    tracing::debug!(error = %e, "close failed");
                }
                Err(pool_closed())
            }
        }
    }

    /// Close the pool.
    ///
    /// Waiting callers fail with `Pool(Closed)`, idle connections are
    /// closed, and lent-out connections are closed when released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.waiters.clear();

            let mut idle = Vec::new();
            state.slots.retain_mut(|slot| match slot.conn.take() {
                Some(conn) => {
                    idle.push(conn);
                    false
                }
                None => true,
            });
            state.live -= idle.len();
            idle
        };

        tracing::debug!(idle = idle.len(), "closing pool");
        for mut conn in idle {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "close failed");
            }
        }
    }
}

fn pool_closed() -> Error {
    Error::pool(PoolErrorKind::Closed, "pool is closed")
}

/// A queued acquire. Dropping it leaves the queue, and a grant that
/// raced with the drop goes to the next waiter.
struct WaitEntry<'a, F: ConnectionFactory> {
    shared: &'a Arc<Shared<F>>,
    id: u64,
    rx: oneshot::Receiver<Grant<Conn<F>>>,
    done: bool,
}

impl<F: ConnectionFactory> WaitEntry<'_, F> {
    async fn wait(mut self) -> Result<Grant<Conn<F>>> {
        let received = (&mut self.rx).await;
        self.done = true;
        received.map_err(|_| pool_closed())
    }
}

impl<F: ConnectionFactory> Drop for WaitEntry<'_, F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.shared.lock();
        state.waiters.retain(|w| w.id != self.id);
        if let Ok(grant) = self.rx.try_recv() {
            state.hand_off(grant);
        }
    }
}

/// Capacity reserved for a connection being opened; returned on drop
/// unless the connection made it into a slot.
struct CreatePermit<'a, F: ConnectionFactory> {
    shared: &'a Arc<Shared<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for CreatePermit<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().release_capacity();
        }
    }
}

/// A connection reserved from a [`Pool`], released when dropped.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<Conn<F>>,
    slot: u64,
    broken: bool,
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Evict the connection instead of reusing it when released.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = Conn<F>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let mut state = self.shared.lock();
        if self.broken || conn.is_closed() || state.closed {
            tracing::debug!(slot = self.slot, broken = self.broken, "evicting connection");
            state.evict(self.slot);
            drop(state);
            drop(conn);
        } else {
            state.hand_off(Grant::Lease {
                slot: self.slot,
                conn,
            });
        }
    }
}
