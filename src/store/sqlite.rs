//! SQLite client: connection pool, transactions and collaborator lifecycle.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};

use crate::error::Result;
use crate::store::migration;

pub type Tx = Transaction<'static, Sqlite>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Access mode of a transaction.
///
/// SQLite has a single (serializable) isolation level, so the access mode
/// is the configurable axis: a read-write transaction takes the write lock
/// up front so a busy writer fails at begin rather than mid-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAccess {
    ReadOnly,
    ReadWrite,
}

/// Components that prepare state against the store when the client starts
/// and release it when the client stops.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the database file, created when missing.
    pub path: PathBuf,

    pub max_connections: u32,
    pub idle_timeout: Option<Duration>,
    pub connection_lifetime: Option<Duration>,
}

/// Client used to access SQLite.
pub struct Client {
    pool: SqlitePool,
    collaborators: Vec<Arc<dyn Lifecycle>>,
}

impl Client {
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let mut pool_options =
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
        if let Some(timeout) = config.idle_timeout {
            pool_options = pool_options.idle_timeout(timeout);
        }
        if let Some(lifetime) = config.connection_lifetime {
            pool_options = pool_options.max_lifetime(lifetime);
        }

        let pool = pool_options.connect_with(options).await?;
        Ok(Self {
            pool,
            collaborators: Vec::new(),
        })
    }

    /// In-memory database for tests. A single connection keeps every
    /// statement on the same memory instance.
    #[cfg(test)]
    pub(crate) async fn memory() -> Self {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        Self {
            pool,
            collaborators: Vec::new(),
        }
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Register a collaborator. `open` runs in registration order on
    /// `start`, `close` in reverse order on `stop`.
    pub fn register(&mut self, collaborator: Arc<dyn Lifecycle>) {
        self.collaborators.push(collaborator);
    }

    /// Advance the schema to the newest revision, then open the
    /// registered collaborators.
    pub async fn start(&self) -> Result<()> {
        migration::Manager::new().run(&self.pool).await?;
        for collaborator in &self.collaborators {
            collaborator.open().await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for collaborator in self.collaborators.iter().rev() {
            collaborator.close().await?;
        }
        self.pool.close().await;
        Ok(())
    }

    pub async fn begin(&self, access: TxAccess) -> Result<Tx> {
        let tx = match access {
            TxAccess::ReadOnly => self.pool.begin_with("BEGIN DEFERRED").await?,
            TxAccess::ReadWrite => self.pool.begin_with("BEGIN IMMEDIATE").await?,
        };
        Ok(tx)
    }

    /// Run `op` inside a transaction: commit when it returns `Ok`, roll
    /// back when it returns `Err`. An unwind inside `op` rolls back
    /// through the transaction guard's drop and keeps propagating.
    pub async fn in_transaction<T, F>(&self, access: TxAccess, op: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T>> + Send,
    {
        let mut tx = self.begin(access).await?;
        match op(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = %rollback_err, "failed to roll back the transaction");
                }
                Err(err)
            }
        }
    }
}
