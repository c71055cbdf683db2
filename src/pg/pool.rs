//! PostgreSQL connection pool.
//!
//! Connections are created lazily up to `pool_max_size` and handed out as
//! RAII guards. Dropping a guard applies the release policy: only a
//! connection that is idle on both ends goes back to the pool.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use super::connection::{ConnectionState, Connector, PgConnection, QueryResult};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::statement::Statement;

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is requeued if it is reusable and the pool
/// is open, and destroyed otherwise.
pub struct PooledConnection {
    /// The actual connection (None once released)
    conn: Option<PgConnection>,
    /// Reference back to the pool
    pool: Arc<PgPoolInner>,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn conn_mut(&mut self) -> Result<&mut PgConnection> {
        self.conn.as_mut().ok_or(Error::Closed)
    }

    /// Run a statement and collect its rows.
    pub async fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.conn_mut()?.query(statement).await
    }

    /// Run a statement and report the affected-row count.
    pub async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.conn_mut()?.execute(statement).await
    }

    /// Run a statement and keep the full result.
    pub async fn run(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.conn_mut()?.run(statement).await
    }

    /// Begin a transaction.
    pub async fn begin(&mut self) -> Result<()> {
        self.conn_mut()?.begin().await
    }

    /// Commit the transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.conn_mut()?.commit().await
    }

    /// Rollback the transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.conn_mut()?.rollback().await
    }

    /// The underlying connection.
    pub fn connection(&self) -> Option<&PgConnection> {
        self.conn.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn
            .as_ref()
            .map_or(ConnectionState::Broken, PgConnection::state)
    }

    /// Check if the connection could go back to the pool as is.
    pub fn is_reusable(&self) -> bool {
        self.conn.as_ref().is_some_and(PgConnection::is_reusable)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // The closed check and the push share the lock with close(), so a
            // connection cannot slip into the queue after it was drained.
            let mut idle = self.pool.idle_connections.lock();
            if conn.is_reusable() && !idle.closed {
                trace!(backend_pid = conn.backend_pid(), "connection released to pool");
                idle.connections.push_back(conn);
            } else {
                debug!(
                    backend_pid = conn.backend_pid(),
                    state = ?conn.state(),
                    transaction = ?conn.transaction_status(),
                    "destroying connection on release"
                );
            }
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
struct PgPoolInner {
    config: Config,
    connector: Connector,
    /// Idle connections, oldest first
    idle_connections: Mutex<Idle>,
    /// Semaphore to limit total connections
    semaphore: Arc<Semaphore>,
}

/// Idle queue and closed flag, guarded together.
struct Idle {
    connections: VecDeque<PgConnection>,
    closed: bool,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// The pool maintains a set of reusable connections, each with its own
/// prepared statement cache.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(config: Config, connector: Connector) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(config.pool_max_size)),
            config,
            connector,
            idle_connections: Mutex::new(Idle {
                connections: VecDeque::new(),
                closed: false,
            }),
        });

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// Waits while `pool_max_size` connections are checked out. Fails with
    /// `Closed` once the pool is closed, waiters included.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        // Acquire a permit (blocks if pool is exhausted)
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        // Try to get an idle connection
        let conn = {
            let mut idle = self.inner.idle_connections.lock();
            if idle.closed {
                return Err(Error::Closed);
            }
            let mut found = None;
            while let Some(conn) = idle.connections.pop_front() {
                if conn.is_reusable() {
                    found = Some(conn);
                    break;
                }
            }
            found
        };

        let conn = match conn {
            Some(c) => {
                trace!(backend_pid = c.backend_pid(), "reusing idle connection");
                c
            }
            None => self.create_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Close the pool.
    ///
    /// Pending and future acquires fail with `Closed`, idle connections are
    /// terminated, and checked-out connections are destroyed on release.
    pub async fn close(&self) {
        let connections = {
            let mut idle = self.inner.idle_connections.lock();
            if idle.closed {
                return;
            }
            idle.closed = true;
            std::mem::take(&mut idle.connections)
        };
        self.inner.semaphore.close();
        debug!(idle = connections.len(), "closing pool");

        for mut conn in connections {
            let _ = conn.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.idle_connections.lock().closed
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_connections.lock().connections.len()
    }

    /// Number of connections that could be checked out right now without
    /// waiting.
    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open and authenticate a new connection, bounded by
    /// `connection_timeout`.
    async fn create_connection(&self) -> Result<PgConnection> {
        let config = &self.inner.config;
        let connect = async {
            let stream = (self.inner.connector)().await?;
            PgConnection::connect_stream(stream, config).await
        };

        match config.connection_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Error::Timeout)?,
            None => connect.await,
        }
    }
}
