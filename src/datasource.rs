//! Pooled data sources.
//!
//! `DataSource` runs every statement on a connection borrowed from its pool.
//! `TransactionalDataSource` pins one connection between `begin` and
//! `commit`/`rollback` and otherwise behaves like its `DataSource`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bridge::CompletionDataSource;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pg::connection::{tcp_connector, ConnectionState, Connector, QueryResult};
use crate::pg::pool::{PgPool, PooledConnection};
use crate::row::Row;
use crate::statement::Statement;

/// Entry point for running statements against a PostgreSQL server.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct DataSource {
    pool: PgPool,
}

impl DataSource {
    /// Create a data source over TCP. No connection is opened yet.
    pub fn new(config: Config) -> Result<Self> {
        let connector = tcp_connector(&config);
        Self::with_connector(config, connector)
    }

    /// Create a data source over a custom transport.
    pub fn with_connector(config: Config, connector: Connector) -> Result<Self> {
        Ok(Self {
            pool: PgPool::new(config, connector)?,
        })
    }

    /// Run a statement and collect its rows.
    pub async fn query(&self, statement: impl Into<Statement>) -> Result<Vec<Row>> {
        Ok(self.run(&statement.into()).await?.rows)
    }

    /// Run a statement and report the affected-row count.
    pub async fn execute(&self, statement: impl Into<Statement>) -> Result<u64> {
        Ok(self.run(&statement.into()).await?.rows_affected())
    }

    pub(crate) async fn run(&self, statement: &Statement) -> Result<QueryResult> {
        with_timeout(self.config().query_timeout, async {
            let mut conn = self.pool.acquire().await?;
            conn.run(statement).await
        })
        .await
    }

    /// A handle that can pin a connection for a transaction.
    pub fn transactional(&self) -> TransactionalDataSource {
        TransactionalDataSource {
            source: self.clone(),
            state: Arc::new(Mutex::new(TxState::Inactive)),
        }
    }

    /// Close the pool. Later operations fail with `Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn config(&self) -> &Config {
        self.pool.config()
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Completion-returning view of this data source.
    pub fn into_completion(self) -> CompletionDataSource {
        CompletionDataSource::create(self)
    }
}

// ============================================================================
// Transactions
// ============================================================================

enum TxState {
    /// No transaction; statements go through the pool.
    Inactive,
    /// `begin` succeeded; statements run on this connection.
    Active(PooledConnection),
    /// The pinned connection broke. Terminal.
    Lost(String),
}

/// A data source that can run a transaction on one pinned connection.
///
/// Clones share the same transaction. Operations on one handle are
/// serialized.
#[derive(Clone)]
pub struct TransactionalDataSource {
    source: DataSource,
    state: Arc<Mutex<TxState>>,
}

impl TransactionalDataSource {
    /// Reserve a connection and issue BEGIN.
    pub async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_open()?;
        match &*state {
            TxState::Inactive => {}
            TxState::Active(_) => {
                return Err(Error::TransactionState("transaction already active"))
            }
            TxState::Lost(reason) => return Err(Error::ConnectionLost(reason.clone())),
        }

        let conn = with_timeout(self.source.config().query_timeout, async {
            let mut conn = self.source.pool().acquire().await?;
            conn.begin().await?;
            Ok(conn)
        })
        .await?;

        debug!(
            backend_pid = conn.connection().map(|c| c.backend_pid()),
            "transaction started"
        );
        *state = TxState::Active(conn);
        Ok(())
    }

    /// Commit and release the pinned connection.
    pub async fn commit(&self) -> Result<()> {
        self.finish(true).await
    }

    /// Roll back and release the pinned connection.
    pub async fn rollback(&self) -> Result<()> {
        self.finish(false).await
    }

    /// Run a statement and collect its rows.
    pub async fn query(&self, statement: impl Into<Statement>) -> Result<Vec<Row>> {
        Ok(self.run(&statement.into()).await?.rows)
    }

    /// Run a statement and report the affected-row count.
    pub async fn execute(&self, statement: impl Into<Statement>) -> Result<u64> {
        Ok(self.run(&statement.into()).await?.rows_affected())
    }

    /// True between a successful `begin` and `commit`/`rollback`.
    pub async fn is_active(&self) -> bool {
        matches!(*self.state.lock().await, TxState::Active(_))
    }

    /// True once the pinned connection has broken.
    pub async fn is_lost(&self) -> bool {
        matches!(*self.state.lock().await, TxState::Lost(_))
    }

    pub fn config(&self) -> &Config {
        self.source.config()
    }

    pub(crate) async fn run(&self, statement: &Statement) -> Result<QueryResult> {
        let mut state = self.state.lock().await;
        self.check_open()?;
        let conn = match &mut *state {
            TxState::Active(conn) => conn,
            TxState::Inactive => return self.source.run(statement).await,
            TxState::Lost(reason) => return Err(Error::ConnectionLost(reason.clone())),
        };

        let result = with_timeout(self.source.config().query_timeout, conn.run(statement)).await;
        if let Err(err) = &result {
            if conn.state() != ConnectionState::Idle {
                self.lose(&mut state, err);
            }
        }
        result
    }

    async fn finish(&self, commit: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        self.check_open()?;

        let mut conn = match std::mem::replace(&mut *state, TxState::Inactive) {
            TxState::Active(conn) => conn,
            TxState::Inactive => return Err(Error::TransactionState("no active transaction")),
            TxState::Lost(reason) => {
                *state = TxState::Lost(reason.clone());
                return Err(Error::ConnectionLost(reason));
            }
        };

        let limit = self.source.config().query_timeout;
        let result = if commit {
            with_timeout(limit, conn.commit()).await
        } else {
            with_timeout(limit, conn.rollback()).await
        };

        match &result {
            Err(err) if conn.state() != ConnectionState::Idle => {
                self.lose(&mut state, err);
            }
            _ => {
                debug!(
                    outcome = if commit { "commit" } else { "rollback" },
                    ok = result.is_ok(),
                    "transaction finished"
                );
                // Released here; the policy decides whether it is reused.
                drop(conn);
            }
        }
        result
    }

    /// Mark the handle lost. Replacing `Active` drops the pinned
    /// connection, which the release policy destroys.
    fn lose(&self, state: &mut TxState, err: &Error) {
        warn!(error = %err, "transaction connection lost");
        *state = TxState::Lost(err.to_string());
    }

    fn check_open(&self) -> Result<()> {
        if self.source.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

/// Bound an operation by the configured query timeout.
///
/// Expiry drops the inner future; a connection interrupted mid-exchange is
/// left non-Idle and gets destroyed on release.
async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            debug!(?limit, "operation timed out");
            Error::Timeout
        })?,
        None => fut.await,
    }
}
