//! Admin schema holding checkpoints and the server-side routines that capture,
//! diff and restore them.

use branchsync_core::{Branch, EngineError};
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::util::db_err;

pub const ADMIN_SCHEMA: &str = "admin";

const ADMIN_SCHEMA_SQL: &str = include_str!("sql/admin_schema.sql");

/// Creates or upgrades the admin schema. Runs as one simple-protocol batch, which
/// Postgres executes atomically.
pub async fn install(pool: &PgPool, branch: Branch) -> Result<(), EngineError> {
    pool.execute(ADMIN_SCHEMA_SQL)
        .await
        .map_err(db_err(format!("install admin schema on {branch}")))?;
    info!(%branch, "admin schema installed");
    Ok(())
}

/// True when `admin.checkpoints` exists on the branch.
pub async fn is_installed(pool: &PgPool, branch: Branch) -> Result<bool, EngineError> {
    sqlx::query_scalar::<_, bool>("SELECT to_regclass('admin.checkpoints') IS NOT NULL")
        .fetch_one(pool)
        .await
        .map_err(db_err(format!("inspect admin schema on {branch}")))
}
