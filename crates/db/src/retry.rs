//! Bounded retry for SQLite lock contention.
//!
//! Connections are opened with a zero busy timeout, so a locked database
//! fails immediately with `SQLITE_BUSY`/`SQLITE_LOCKED` instead of blocking
//! a runtime thread inside SQLite. [`retry_locked()`] turns those failures
//! into a cooperative sleep-and-retry loop with an overall deadline.

use futures::future::BoxFuture;
use std::time::Duration;

/// Pause between two attempts on a locked database.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Default upper bound on the time spent retrying a single operation.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can tell whether they were caused by lock contention.
pub trait Contention {
    fn is_locked(&self) -> bool;
}

impl Contention for sqlx::Error {
    fn is_locked(&self) -> bool {
        let sqlx::Error::Database(e) = self else {
            return false;
        };
        // SQLITE_BUSY, SQLITE_LOCKED and their extended codes.
        if let Some(code) = e.code()
            && matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517")
        {
            return true;
        }
        e.message().contains("database is locked")
    }
}

/// Outcome of an operation that never got past lock contention, or failed
/// for another reason.
#[derive(Debug)]
pub enum Busy<E> {
    /// Still locked when the deadline passed.
    TimedOut(Duration),
    /// Failed with an error unrelated to locking.
    Failed(E),
}

/// Run `op` against `state` until it stops failing with a lock error, for at
/// most `limit`.
///
/// `op` may be invoked several times, so it must be safe to repeat (a whole
/// transaction, not half of one).
///
/// ```no_run
/// use imgcache_db::retry::{Busy, retry_locked};
/// use sqlx::SqliteConnection;
/// use std::time::Duration;
///
/// async fn vacuum(conn: &mut SqliteConnection) -> Result<(), Busy<sqlx::Error>> {
///     retry_locked(conn, Duration::from_secs(2), |conn| {
///         Box::pin(async move { sqlx::query("VACUUM").execute(conn).await.map(|_| ()) })
///     })
///     .await
/// }
/// ```
pub async fn retry_locked<S, T, E, F>(state: &mut S, limit: Duration, mut op: F) -> Result<T, Busy<E>>
where
    S: ?Sized + Send,
    E: Contention,
    F: for<'s> FnMut(&'s mut S) -> BoxFuture<'s, Result<T, E>>,
{
    let attempts = async {
        let mut attempt: u32 = 1;
        loop {
            match op(&mut *state).await {
                Err(e) if e.is_locked() => {
                    tracing::trace!(attempt, "Database is locked, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_INTERVAL).await;
                },
                result => return result,
            }
        }
    };
    match tokio::time::timeout(limit, attempts).await {
        Ok(result) => result.map_err(Busy::Failed),
        Err(_elapsed) => Err(Busy::TimedOut(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Locked,
        Broken,
    }
    impl Contention for FakeError {
        fn is_locked(&self) -> bool {
            matches!(self, Self::Locked)
        }
    }

    #[tokio::test]
    async fn test_retries_until_unlocked() {
        let mut remaining_locks = 3u32;
        let result = retry_locked(&mut remaining_locks, Duration::from_secs(2), |remaining| {
            Box::pin(async move {
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(FakeError::Locked)
                } else {
                    Ok("done")
                }
            })
        })
        .await;
        assert!(matches!(result, Ok("done")));
        assert_eq!(remaining_locks, 0);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let mut calls = 0u32;
        let result: Result<(), _> = retry_locked(&mut calls, Duration::from_secs(2), |calls| {
            Box::pin(async move {
                *calls += 1;
                Err(FakeError::Broken)
            })
        })
        .await;
        assert!(matches!(result, Err(Busy::Failed(FakeError::Broken))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_limit() {
        let mut calls = 0u32;
        let limit = Duration::from_millis(200);
        let result: Result<(), _> = retry_locked(&mut calls, limit, |calls| {
            Box::pin(async move {
                *calls += 1;
                Err(FakeError::Locked)
            })
        })
        .await;
        assert!(matches!(result, Err(Busy::TimedOut(d)) if d == limit));
        assert!(calls > 1);
    }
}
