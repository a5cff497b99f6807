//! Database connections and scoped transactions.

use exn::ResultExt;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteSynchronous};
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::retry::{Busy, DEFAULT_LOCK_TIMEOUT, retry_locked};

/// Handle on the metadata database file.
///
/// Unlike a long-running service, the cache shares its database with other
/// processes (API workers, the pruner, the cleaner), so no connection is kept
/// around: every logical operation opens its own connection, runs one
/// transaction through [`scoped()`](Self::scoped) and closes it again.
#[derive(Debug, Clone)]
pub struct Database {
    options: SqliteConnectOptions,
    lock_timeout: Duration,
}

impl Database {
    /// Open (creating if needed) the database at `path` and make sure the
    /// `cached_images` table exists.
    ///
    /// Failures here are raised as [`ErrorKind::Schema`], unlike failures in
    /// [`scoped()`](Self::scoped) which are only logged.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, lock_timeout: Option<Duration>) -> Result<Self> {
        let options = Self::base_options().filename(path.as_ref()).create_if_missing(true);
        let db = Self { options, lock_timeout: lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT) };
        db.initialize().await?;
        Ok(db)
    }

    /// Connection options applied to every connection.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // PRAGMA synchronous = NORMAL (balance between safety and speed)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY")
            .pragma("count_changes", "OFF")
            // Lock contention is handled by `retry_locked()`, which yields to
            // the runtime between attempts instead of blocking inside SQLite.
            .busy_timeout(Duration::ZERO)
    }

    async fn initialize(&self) -> Result<()> {
        match self.run(create_schema).await {
            Ok(()) => Ok(()),
            Err(Busy::TimedOut(limit)) => Err(exn::Exn::from(ErrorKind::LockTimeout(limit))).or_raise(|| ErrorKind::Schema),
            Err(Busy::Failed(e)) => {
                tracing::error!(error = %e, "Failed to initialize the image cache database");
                Err(e).or_raise(|| ErrorKind::Schema)
            },
        }
    }

    /// Open a fresh connection with all pragmas applied.
    pub async fn connect(&self) -> Result<SqliteConnection> {
        SqliteConnection::connect_with(&self.options).await.or_raise(|| ErrorKind::Database)
    }

    async fn close(conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Failed to close database connection cleanly");
        }
    }

    /// Run `f` inside a transaction on a short-lived connection.
    ///
    /// The transaction is committed when `f` succeeds. When it fails, the
    /// transaction is rolled back and the error is logged and swallowed:
    /// the result is `Ok(None)` and callers fall back to a conservative
    /// default. Lock contention, including a lock that is already held while
    /// connecting, retries the whole attempt; only running out of time
    /// ([`ErrorKind::LockTimeout`]) is reported as an error.
    pub async fn scoped<T, F>(&self, operation: &'static str, f: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, sqlx::Result<T>> + Send + 'static,
    {
        match self.run(f).await {
            Ok(value) => Ok(Some(value)),
            Err(Busy::TimedOut(limit)) => {
                tracing::warn!(operation, ?limit, "Gave up waiting for the cache database lock");
                exn::bail!(ErrorKind::LockTimeout(limit))
            },
            Err(Busy::Failed(e)) => {
                tracing::error!(operation, error = %e, "Error executing SQLite call, rolled back");
                Ok(None)
            },
        }
    }

    /// Connect and run `f` in a transaction until the database stops being
    /// locked or the lock timeout runs out.
    async fn run<T, F>(&self, f: F) -> std::result::Result<T, Busy<sqlx::Error>>
    where
        T: Send + 'static,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, sqlx::Result<T>> + Send + 'static,
    {
        let mut state = (self.options.clone(), f);
        retry_locked(&mut state, self.lock_timeout, |(options, f)| Box::pin(Self::attempt(options, f))).await
    }

    async fn attempt<T, F>(options: &SqliteConnectOptions, f: &mut F) -> sqlx::Result<T>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, sqlx::Result<T>>,
    {
        let mut conn = SqliteConnection::connect_with(options).await?;
        let outcome = Self::transaction(&mut conn, f).await;
        Self::close(conn).await;
        outcome
    }

    async fn transaction<T, F>(conn: &mut SqliteConnection, f: &mut F) -> sqlx::Result<T>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, sqlx::Result<T>>,
    {
        let mut tx = conn.begin().await?;
        // Dropping `tx` on the error path rolls the transaction back.
        let value = f(&mut *tx).await?;
        tx.commit().await?;
        Ok(value)
    }
}

fn create_schema(conn: &mut SqliteConnection) -> BoxFuture<'_, sqlx::Result<()>> {
    Box::pin(async move { sqlx::Executor::execute(conn, sqlx::raw_sql(include_str!("../queries/schema.sql"))).await.map(|_| ()) })
}
