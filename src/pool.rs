//! Bounded connection pool.
//!
//! A semaphore with `max_connections` permits bounds the connections that are
//! lent out or being created; idle connections hold no permit. The idle set
//! and the live count share one mutex.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::PgConfig;
use crate::connection::{ConnectionState, PgConnection, Query};
use crate::error::{PgError, PgResult};
use crate::logger::{default_logger, Logger};
use crate::notify::PgListener;
use crate::protocol::TransactionStatus;
use crate::registry::{default_registry, Registry};
use crate::row::QueryResult;
use crate::types::PgValue;

/// Hook run once on every new physical connection before it is handed out.
pub type AfterConnect = Arc<dyn for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, PgResult<()>> + Send + Sync>;

// ============================================================================
// Pool Configuration
// ============================================================================

#[derive(Clone)]
pub struct PgPoolConfig {
    pub connection: PgConfig,
    pub min_connections: u32,
    pub max_connections: u32,
    /// How long `acquire` waits for a free slot; forever when `None`.
    pub acquire_timeout: Option<Duration>,
    pub after_connect: Option<AfterConnect>,
    pub registry: Arc<Registry>,
    pub logger: Arc<dyn Logger>,
}

impl std::fmt::Debug for PgPoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPoolConfig")
            .field("host", &self.connection.host)
            .field("database", &self.connection.database)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("after_connect", &self.after_connect.is_some())
            .finish()
    }
}

impl PgPoolConfig {
    pub fn new(connection: PgConfig) -> Self {
        Self {
            connection,
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: None,
            after_connect: None,
            registry: default_registry(),
            logger: default_logger(),
        }
    }

    pub fn from_url(url: &str) -> PgResult<Self> {
        Ok(Self::new(PgConfig::from_url(url)?))
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn after_connect<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, PgResult<()>> + Send + Sync + 'static,
    {
        self.after_connect = Some(Arc::new(hook));
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.connection.statement_cache_capacity = capacity;
        self
    }

    fn validate(&self) -> PgResult<()> {
        if self.max_connections < 1 {
            return Err(PgError::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Physical connections, idle or lent.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection lent by the pool. Dropping it (or calling `release`) gives
/// it back; connections that are not idle and healthy are discarded.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    pool: Arc<PgPoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("conn", &self.conn).finish()
    }
}

impl PooledConnection {
    pub fn release(self) {
        drop(self);
    }

    /// Take the connection out of the pool for good. It no longer counts
    /// against `max_connections`.
    pub fn detach(mut self) -> Option<PgConnection> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.pool.state.lock().live -= 1;
        }
        conn
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
        // The permit is released after the connection is back in the idle set
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PoolState {
    idle: Vec<PgConnection>,
    /// Physical connections: idle, lent, or being created.
    live: usize,
    closed: bool,
}

struct PgPoolInner {
    config: PgPoolConfig,
    state: Mutex<PoolState>,
    semaphore: Arc<Semaphore>,
}

impl PgPoolInner {
    fn give_back(&self, conn: PgConnection) {
        let reusable = conn.state() == ConnectionState::Ready(TransactionStatus::Idle) && !conn.has_listeners();

        let mut state = self.state.lock();
        if reusable && !state.closed {
            state.idle.push(conn);
            return;
        }
        state.live -= 1;
        let closed = state.closed;
        drop(state);

        if reusable || closed {
            close_in_background(conn);
        } else {
            self.config.logger.debug(&format!(
                "Discarding connection (pid {}) released in state {:?}",
                conn.backend_pid(),
                conn.state()
            ));
        }
    }
}

/// Send Terminate without blocking the caller; outside a runtime the socket
/// is simply dropped.
fn close_in_background(mut conn: PgConnection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = conn.close().await;
        });
    }
}

/// Undoes a live-count reservation unless the connection was created.
struct Reservation<'a> {
    pool: &'a PgPoolInner,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().live -= 1;
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool. Cheap to clone.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool").field("stats", &self.stats()).finish()
    }
}

impl PgPool {
    /// Create a pool without opening any connection.
    pub fn new(config: PgPoolConfig) -> PgResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PgPoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    live: 0,
                    closed: false,
                }),
            }),
        })
    }

    /// Create a pool and open `min_connections` up front.
    pub async fn connect(config: PgPoolConfig) -> PgResult<Self> {
        let pool = Self::new(config)?;
        for _ in 0..pool.inner.config.min_connections {
            pool.inner.state.lock().live += 1;
            let mut reservation = Reservation {
                pool: &pool.inner,
                armed: true,
            };
            let conn = pool.create_connection().await?;
            reservation.armed = false;
            pool.inner.state.lock().idle.push(conn);
        }
        pool.inner.config.logger.info(&format!(
            "Pool ready with {} connection(s), max {}",
            pool.inner.config.min_connections, pool.inner.config.max_connections
        ));
        Ok(pool)
    }

    /// Borrow a connection, waiting up to `acquire_timeout` for a free slot.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }
        let semaphore = Arc::clone(&self.inner.semaphore);
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, semaphore.acquire_owned())
                .await
                .map_err(|_| PgError::PoolExhausted)?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| PgError::PoolClosed)?;
        self.checkout(permit).await
    }

    /// Borrow a connection only if a slot is free right now.
    pub async fn try_acquire(&self) -> PgResult<PooledConnection> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }
        let permit = Arc::clone(&self.inner.semaphore)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => PgError::PoolClosed,
                TryAcquireError::NoPermits => PgError::PoolExhausted,
            })?;
        self.checkout(permit).await
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> PgResult<PooledConnection> {
        let reused = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PgError::PoolClosed);
            }
            let conn = state.idle.pop();
            if conn.is_none() {
                state.live += 1;
            }
            conn
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let mut reservation = Reservation {
                    pool: &self.inner,
                    armed: true,
                };
                let conn = self.create_connection().await?;
                reservation.armed = false;
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Open a connection and run the after-connect hook on it.
    async fn create_connection(&self) -> PgResult<PgConnection> {
        let config = &self.inner.config;
        let mut conn = PgConnection::connect_with(
            config.connection.clone(),
            Arc::clone(&config.registry),
            Arc::clone(&config.logger),
        )
        .await?;

        if let Some(hook) = &config.after_connect {
            if let Err(e) = hook(&mut conn).await {
                config
                    .logger
                    .warning(&format!("after_connect failed, discarding connection: {}", e));
                let _ = conn.close().await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    /// Run one statement on a pooled connection.
    pub async fn execute<'q>(&self, query: impl Into<Query<'q>>, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut conn = self.acquire().await?;
        conn.execute(query, params).await
    }

    pub async fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let mut conn = self.acquire().await?;
        conn.simple_query(sql).await
    }

    /// A dedicated listening connection with the pool's settings. It does
    /// not count against `max_connections`.
    pub async fn listener(&self) -> PgResult<PgListener> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }
        Ok(PgListener::from_connection(self.create_connection().await?))
    }

    /// Close idle connections and refuse new acquires. Lent connections are
    /// closed when they come back.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            idle
        };
        self.inner.semaphore.close();

        for mut conn in idle {
            let _ = conn.close().await;
        }
        self.inner.config.logger.info("Pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Physical connections currently open (idle or lent).
    pub fn size(&self) -> usize {
        self.inner.state.lock().live
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            size: state.live,
            idle: state.idle.len(),
            in_use: state.live - state.idle.len(),
            max_size: self.inner.config.max_connections as usize,
        }
    }

    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }
}
