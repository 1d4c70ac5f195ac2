//! Session-level advisory lock serializing destructive operations on one branch.
//!
//! The lock lives on a pooled connection owned by [`AdvisoryLock`]. `release` unlocks
//! and hands the connection back to the pool; a guard dropped without `release`
//! (error path, panic, cancelled future) detaches its connection and closes it, which
//! ends the server session and frees the lock. The lock can never outlive the guard.

use std::time::Duration;

use branchsync_core::{Branch, EngineError};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Postgres;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::util::db_err;

/// Well-known key reserved for sync and rollback. Each branch is its own server, so
/// the key is scoped to the branch it is taken on.
pub const SYNC_LOCK_KEY: i64 = 0x6272_616e_6368;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

pub struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    branch: Branch,
    key: i64,
}

impl AdvisoryLock {
    /// Polls `pg_try_advisory_lock` until it succeeds or `wait` elapses, in which case
    /// it fails with `LockContention`.
    pub async fn acquire(pool: &PgPool, branch: Branch, key: i64, wait: Duration) -> Result<Self, EngineError> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(db_err(format!("acquire lock connection on {branch}")))?;
        let deadline = Instant::now() + wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_err(format!("advisory lock on {branch}")))?;
            if locked {
                debug!(%branch, key, "advisory lock acquired");
                return Ok(Self { conn: Some(conn), branch, key });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::LockContention(format!(
                    "advisory lock {key} on {branch} still held by another session after {}ms",
                    wait.as_millis()
                )));
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn branch(&self) -> Branch {
        self.branch
    }

    /// The connection holding the lock; work that must be serialized runs here.
    pub fn connection(&mut self) -> Result<&mut PgConnection, EngineError> {
        let branch = self.branch;
        self.conn
            .as_deref_mut()
            .ok_or_else(|| EngineError::Database(format!("advisory lock on {branch} already released")))
    }

    /// Unlocks and returns the connection to the pool. A failed unlock closes the
    /// session instead, so the lock is released either way.
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => debug!(branch = %self.branch, key = self.key, "advisory lock released"),
            Ok(false) => {
                warn!(branch = %self.branch, key = self.key, "advisory lock was not held at release");
            }
            Err(e) => {
                warn!(branch = %self.branch, error = %e, "unlock failed; closing lock session");
                drop(conn.detach());
            }
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(branch = %self.branch, key = self.key, "lock guard dropped without release; closing lock session");
            drop(conn.detach());
        }
    }
}
