//! Checkpoint store backed by the admin schema.

use std::sync::Arc;

use branchsync_core::{
    Branch, Checkpoint, CheckpointId, CheckpointTable, DiffRow, EngineError,
};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::registry::BranchRegistry;
use crate::schema;
use crate::util::db_err;

/// Schemas captured by every checkpoint.
pub const CAPTURED_SCHEMAS: &[&str] = &["public"];

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    registry: Arc<BranchRegistry>,
}

impl CheckpointStore {
    pub fn new(registry: Arc<BranchRegistry>) -> Self {
        Self { registry }
    }

    /// Installs the admin schema and its routines on `branch`.
    pub async fn install(&self, branch: Branch) -> Result<(), EngineError> {
        let pool = self.registry.resolve(branch)?;
        schema::install(pool, branch).await
    }

    pub async fn is_installed(&self, branch: Branch) -> Result<bool, EngineError> {
        let pool = self.registry.resolve(branch)?;
        schema::is_installed(pool, branch).await
    }

    /// Captures the branch's tables and returns the new checkpoint's id.
    #[instrument(skip(self, notes))]
    pub async fn create(
        &self,
        branch: Branch,
        label: &str,
        notes: Option<&str>,
        actor: Option<&str>,
    ) -> Result<CheckpointId, EngineError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(EngineError::InvalidArgument("checkpoint label must not be empty".into()));
        }
        let pool = self.registry.resolve(branch)?;
        let ctx = format!("create checkpoint on {branch}");

        // One snapshot for every table so counts and row images agree with each other.
        let mut tx = pool.begin().await.map_err(db_err(&ctx))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(db_err(&ctx))?;
        let id: Uuid = sqlx::query_scalar("SELECT admin.create_checkpoint($1, $2, $3, $4, $5)")
            .bind(branch.as_str())
            .bind(label)
            .bind(notes)
            .bind(actor)
            .bind(CAPTURED_SCHEMAS)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err(&ctx))?;
        tx.commit().await.map_err(db_err(&ctx))?;

        info!(%branch, checkpoint = %id, label, "checkpoint created");
        Ok(CheckpointId(id))
    }

    /// All checkpoints of the branch, newest first.
    pub async fn list(&self, branch: Branch) -> Result<Vec<Checkpoint>, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let ctx = format!("list checkpoints on {branch}");
        let rows = sqlx::query(
            r#"
            SELECT id, branch, label, schema_name, notes, created_by, created_at
            FROM admin.checkpoints
            WHERE branch = $1
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(branch.as_str())
        .fetch_all(pool)
        .await
        .map_err(db_err(&ctx))?;

        rows.iter()
            .map(|row| checkpoint_from_row(row).map_err(db_err(&ctx)))
            .collect()
    }

    /// Fails with `NotFound` when `id` does not belong to `branch`.
    pub async fn get(&self, branch: Branch, id: CheckpointId) -> Result<Checkpoint, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let ctx = format!("load checkpoint {id} on {branch}");
        let row = sqlx::query(
            r#"
            SELECT id, branch, label, schema_name, notes, created_by, created_at
            FROM admin.checkpoints
            WHERE id = $1 AND branch = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(branch.as_str())
        .fetch_optional(pool)
        .await
        .map_err(db_err(&ctx))?;

        match row {
            Some(row) => checkpoint_from_row(&row).map_err(db_err(&ctx)),
            None => Err(EngineError::NotFound(format!("checkpoint {id} on {branch}"))),
        }
    }

    /// Per-table row counts recorded when the checkpoint was taken.
    pub async fn capture_summary(
        &self,
        branch: Branch,
        id: CheckpointId,
    ) -> Result<Vec<CheckpointTable>, EngineError> {
        self.get(branch, id).await?;
        let pool = self.registry.resolve(branch)?;
        let rows = sqlx::query(
            r#"
            SELECT schema_name, table_name, row_count
            FROM admin.checkpoint_tables
            WHERE checkpoint_id = $1
            ORDER BY schema_name, table_name
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(pool)
        .await
        .map_err(db_err(format!("summarize checkpoint {id} on {branch}")))?;

        rows.iter()
            .map(|r| {
                Ok(CheckpointTable {
                    schema_name: r.try_get("schema_name")?,
                    table_name: r.try_get("table_name")?,
                    row_count: r.try_get("row_count")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(db_err(format!("decode checkpoint {id} summary")))
    }

    /// Live counts against captured counts, ordered by table name.
    #[instrument(skip(self))]
    pub async fn diff(&self, branch: Branch, id: CheckpointId) -> Result<Vec<DiffRow>, EngineError> {
        self.get(branch, id).await?;
        let pool = self.registry.resolve(branch)?;
        let rows = sqlx::query(
            "SELECT table_name, current_count, checkpoint_count FROM admin.diff_checkpoint($1)",
        )
        .bind(id.as_uuid())
        .fetch_all(pool)
        .await
        .map_err(db_err(format!("diff checkpoint {id} on {branch}")))?;

        rows.iter()
            .map(|r| {
                Ok(DiffRow::new(
                    r.try_get::<String, _>("table_name")?,
                    r.try_get::<i64, _>("current_count")?,
                    r.try_get::<i64, _>("checkpoint_count")?,
                ))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(db_err(format!("decode diff of checkpoint {id}")))
    }
}

fn checkpoint_from_row(row: &PgRow) -> Result<Checkpoint, sqlx::Error> {
    let stored: String = row.try_get("branch")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(Checkpoint {
        id: CheckpointId(row.try_get::<Uuid, _>("id")?),
        branch: decode_branch(&stored)?,
        label: row.try_get("label")?,
        schema_name: row.try_get("schema_name")?,
        notes: row.try_get("notes")?,
        created_by: row.try_get("created_by")?,
        created_at,
    })
}

/// A stored branch name this build does not know is corrupt data, not a default.
fn decode_branch(stored: &str) -> Result<Branch, sqlx::Error> {
    stored.parse().map_err(|e: EngineError| sqlx::Error::ColumnDecode {
        index: "branch".into(),
        source: Box::new(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_branch_names_decode() {
        assert_eq!(decode_branch("dev").unwrap(), Branch::Dev);
        assert_eq!(decode_branch("prod").unwrap(), Branch::Prod);
    }

    #[test]
    fn unknown_branch_name_is_a_decode_error() {
        match decode_branch("staging") {
            Err(sqlx::Error::ColumnDecode { index, .. }) => assert_eq!(index, "branch"),
            other => panic!("expected column decode error, got {other:?}"),
        }
        let err = decode_branch("").map_err(db_err("load checkpoint")).unwrap_err();
        assert!(matches!(err, EngineError::Database(_)), "{err:?}");
    }
}
