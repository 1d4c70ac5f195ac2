//! Transactional restore of a branch to one of its checkpoints.
//!
//! `Idle -> BeginTx -> Restoring -> Committed`, or `... -> Restoring -> RolledBack`
//! where the transaction is rolled back explicitly before the error is returned.
//! Confirmation of the destructive action is the caller's job.

use std::sync::Arc;
use std::time::Duration;

use branchsync_core::{Branch, CheckpointId, EngineError, Phase};
use sqlx::Connection;
use tracing::{debug, info, instrument, warn};

use crate::checkpoints::CheckpointStore;
use crate::lock::{AdvisoryLock, SYNC_LOCK_KEY};
use crate::registry::BranchRegistry;
use crate::util::rollback_quietly;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackState {
    Idle,
    BeginTx,
    Restoring,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug)]
pub struct RollbackExecutor {
    registry: Arc<BranchRegistry>,
    checkpoints: CheckpointStore,
    lock_timeout: Duration,
}

impl RollbackExecutor {
    pub fn new(registry: Arc<BranchRegistry>) -> Self {
        let lock_timeout = registry.config().lock_timeout;
        Self {
            checkpoints: CheckpointStore::new(registry.clone()),
            registry,
            lock_timeout,
        }
    }

    /// Restores every table captured by `id`, all or nothing. `NotFound` is returned
    /// before any lock or transaction is taken.
    #[instrument(skip(self))]
    pub async fn rollback(&self, branch: Branch, id: CheckpointId) -> Result<(), EngineError> {
        let checkpoint = self.checkpoints.get(branch, id).await?;
        let pool = self.registry.resolve(branch)?;

        let mut lock = AdvisoryLock::acquire(pool, branch, SYNC_LOCK_KEY, self.lock_timeout).await?;
        let outcome = restore(&mut lock, id).await;
        lock.release().await;

        match &outcome {
            Ok(()) => info!(%branch, checkpoint = %id, label = %checkpoint.label, "branch rolled back"),
            Err(e) => warn!(%branch, checkpoint = %id, error = %e, "rollback failed; branch unchanged"),
        }
        outcome
    }
}

async fn restore(lock: &mut AdvisoryLock, id: CheckpointId) -> Result<(), EngineError> {
    let failed = |phase: Phase, e: sqlx::Error| EngineError::Transaction {
        phase,
        message: e.to_string(),
        safety_checkpoint: Some(id),
    };
    enter(RollbackState::Idle);

    let conn = lock.connection()?;
    let mut tx = conn.begin().await.map_err(|e| failed(Phase::BeginTransaction, e))?;
    enter(RollbackState::BeginTx);

    enter(RollbackState::Restoring);
    let restored = sqlx::query("SELECT admin.rollback_to_checkpoint($1)")
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await;

    if let Err(e) = restored {
        rollback_quietly(tx, "checkpoint restore").await;
        enter(RollbackState::RolledBack);
        return Err(failed(Phase::Restore, e));
    }

    tx.commit().await.map_err(|e| failed(Phase::Commit, e))?;
    enter(RollbackState::Committed);
    Ok(())
}

fn enter(state: RollbackState) {
    debug!(?state, "rollback state");
}
