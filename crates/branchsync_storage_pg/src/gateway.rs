//! Read-mostly introspection over a branch: table listing, column and index
//! metadata, ad-hoc diagnostic queries and migration history.
//!
//! Diagnostic query failures come back as [`QueryOutcome::Failure`]; only
//! configuration problems are returned as errors.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use branchsync_core::{
    ensure_read_only, Branch, ColumnInfo, ColumnMeta, EngineError, IndexInfo, MigrationRecord,
    QueryOutcome, QueryResult, TableInfo,
};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::{Column, Connection, Executor, Row, Statement, TypeInfo};
use tracing::{debug, instrument, warn};

use crate::ident::qualified;
use crate::registry::BranchRegistry;
use crate::util::{db_err, rollback_quietly};

#[derive(Clone, Debug)]
pub struct QueryGateway {
    registry: Arc<BranchRegistry>,
}

impl QueryGateway {
    pub fn new(registry: Arc<BranchRegistry>) -> Self {
        Self { registry }
    }

    /// Tables, partitioned tables, views and materialized views outside the system
    /// schemas. Row counts are planner estimates.
    #[instrument(skip(self))]
    pub async fn list_tables(&self, branch: Branch) -> Result<Vec<TableInfo>, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let rows: Vec<(String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT n.nspname::text,
                   c.relname::text,
                   CASE c.relkind
                       WHEN 'r' THEN 'BASE TABLE'
                       WHEN 'p' THEN 'PARTITIONED TABLE'
                       WHEN 'v' THEN 'VIEW'
                       WHEN 'm' THEN 'MATERIALIZED VIEW'
                   END,
                   pg_total_relation_size(c.oid)::bigint,
                   GREATEST(c.reltuples, 0)::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relkind IN ('r', 'p', 'v', 'm')
              AND n.nspname NOT IN ('pg_catalog', 'information_schema')
              AND n.nspname NOT LIKE 'pg_toast%'
              AND n.nspname NOT LIKE 'pg_temp%'
            ORDER BY n.nspname, c.relname
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(db_err(format!("list tables on {branch}")))?;

        Ok(rows
            .into_iter()
            .map(|(schema, name, table_type, size_bytes, row_estimate)| TableInfo {
                schema,
                name,
                table_type,
                size_bytes,
                row_estimate,
            })
            .collect())
    }

    /// Columns in ordinal order; `NotFound` when the table does not exist.
    pub async fn table_columns(&self, branch: Branch, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let mut conn = pool.acquire().await.map_err(db_err(format!("columns on {branch}")))?;
        ensure_relation(&mut conn, branch, schema, table).await?;

        let rows: Vec<(String, String, bool, Option<String>, i32)> = sqlx::query_as(
            r#"
            SELECT column_name::text,
                   data_type::text,
                   is_nullable = 'YES',
                   column_default::text,
                   ordinal_position::int
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err(format!("columns of {schema}.{table} on {branch}")))?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable, default, ordinal)| ColumnInfo {
                name,
                data_type,
                is_nullable,
                default,
                ordinal,
            })
            .collect())
    }

    pub async fn table_indexes(&self, branch: Branch, schema: &str, table: &str) -> Result<Vec<IndexInfo>, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let mut conn = pool.acquire().await.map_err(db_err(format!("indexes on {branch}")))?;
        ensure_relation(&mut conn, branch, schema, table).await?;

        let rows: Vec<(String, String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT i.relname::text,
                   pg_get_indexdef(ix.indexrelid),
                   ix.indisunique,
                   ix.indisprimary
            FROM pg_index ix
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE n.nspname = $1 AND t.relname = $2
            ORDER BY i.relname
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err(format!("indexes of {schema}.{table} on {branch}")))?;

        Ok(rows
            .into_iter()
            .map(|(name, definition, is_unique, is_primary)| IndexInfo {
                name,
                definition,
                is_unique,
                is_primary,
            })
            .collect())
    }

    /// Runs one statement in its own transaction and reports columns, rows and
    /// wall-clock duration. Driver errors are part of the outcome.
    ///
    /// Session settings the statement changes (`SET search_path`, `SET
    /// statement_timeout`, ...) are reset before the connection goes back to the pool;
    /// a connection that cannot be reset is closed instead.
    #[instrument(skip(self, sql))]
    pub async fn execute_query(&self, branch: Branch, sql: &str) -> Result<QueryOutcome, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let started = Instant::now();
        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return Ok(finish(Err(e.to_string()), started)),
        };

        let outcome = async {
            let mut tx = conn.begin().await.map_err(|e| e.to_string())?;
            match run_statement(&mut *tx, sql).await {
                Ok(result) => {
                    tx.commit().await.map_err(|e| e.to_string())?;
                    Ok(result)
                }
                Err(e) => {
                    rollback_quietly(tx, "diagnostic query").await;
                    Err(e)
                }
            }
        }
        .await;

        if let Err(e) = sqlx::query("RESET ALL").execute(&mut *conn).await {
            warn!(%branch, error = %e, "could not reset session; closing connection");
            let _ = conn.detach().close().await;
        }
        Ok(finish(outcome, started))
    }

    /// Like [`execute_query`](Self::execute_query), but only single `SELECT`/`WITH`
    /// statements pass, and they run inside a `READ ONLY` transaction that is always
    /// rolled back.
    #[instrument(skip(self, sql))]
    pub async fn execute_read_only(&self, branch: Branch, sql: &str) -> Result<QueryOutcome, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let started = Instant::now();
        if let Err(rejected) = ensure_read_only(sql) {
            debug!(%branch, error = %rejected, "statement rejected");
            return Ok(finish(Err(rejected.to_string()), started));
        }

        let outcome = async {
            let mut conn = pool.acquire().await.map_err(|e| e.to_string())?;
            let mut tx = conn.begin().await.map_err(|e| e.to_string())?;
            if let Err(e) = sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await {
                rollback_quietly(tx, "read-only query").await;
                return Err(e.to_string());
            }
            let result = run_statement(&mut *tx, sql).await;
            rollback_quietly(tx, "read-only query").await;
            result
        }
        .await;
        Ok(finish(outcome, started))
    }

    /// Applied migrations, newest first. A branch without the tracking table has no
    /// history rather than an error.
    #[instrument(skip(self))]
    pub async fn migration_history(&self, branch: Branch) -> Result<Vec<MigrationRecord>, EngineError> {
        let pool = self.registry.resolve(branch)?;
        let cfg = self.registry.config();
        let (schema, table) = (cfg.migrations_schema.as_str(), cfg.migrations_table.as_str());
        let mut conn = pool.acquire().await.map_err(db_err(format!("migrations on {branch}")))?;

        if !relation_exists(&mut conn, schema, table).await.map_err(db_err(format!("migrations on {branch}")))? {
            debug!(%branch, schema, table, "no migration table");
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, String, i64)> = sqlx::query_as(&format!(
            "SELECT id::bigint, hash::text, created_at::bigint FROM {} ORDER BY created_at DESC, id DESC",
            qualified(schema, table)
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err(format!("read migrations on {branch}")))?;

        Ok(rows
            .into_iter()
            .map(|(id, hash, created_at)| MigrationRecord { id, hash, created_at })
            .collect())
    }
}

async fn relation_exists(conn: &mut PgConnection, schema: &str, table: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
        )
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_one(conn)
    .await
}

async fn ensure_relation(conn: &mut PgConnection, branch: Branch, schema: &str, table: &str) -> Result<(), EngineError> {
    let found = relation_exists(conn, schema, table)
        .await
        .map_err(db_err(format!("look up {schema}.{table} on {branch}")))?;
    if found {
        Ok(())
    } else {
        Err(EngineError::NotFound(format!("table {schema}.{table} on {branch}")))
    }
}

fn finish(outcome: Result<QueryResult, String>, started: Instant) -> QueryOutcome {
    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(mut result) => {
            result.duration_ms = duration_ms;
            QueryOutcome::Success(result)
        }
        Err(error) => QueryOutcome::Failure { error, duration_ms },
    }
}

// -----------------------
// Statement execution
// -----------------------

/// Describes the statement first; row-returning statements are read back as json so
/// any column type survives, everything else reports rows affected.
async fn run_statement(conn: &mut PgConnection, sql: &str) -> Result<QueryResult, String> {
    let body = strip_terminator(sql);
    let described = (&mut *conn).prepare(body).await.map_err(|e| e.to_string())?;
    let columns: Vec<ColumnMeta> = described
        .columns()
        .iter()
        .map(|c| ColumnMeta {
            name: c.name().to_string(),
            r#type: c.type_info().name().to_string(),
        })
        .collect();

    if columns.is_empty() {
        let done = (&mut *conn).execute(body).await.map_err(|e| e.to_string())?;
        return Ok(QueryResult {
            columns,
            rows: Vec::new(),
            row_count: done.rows_affected(),
            duration_ms: 0,
        });
    }

    let rows = if wraps_as_subquery(body) {
        let images: Vec<String> = sqlx::query_scalar(&format!(
            "WITH q AS ({body}\n) SELECT row_to_json(q)::text FROM q"
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;
        images
            .iter()
            .map(|image| row_values(image, &columns))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("decode row: {e}"))?
    } else {
        text_rows(conn, body, columns.len()).await?
    };

    Ok(QueryResult {
        row_count: rows.len() as u64,
        columns,
        rows,
        duration_ms: 0,
    })
}

/// SHOW, EXPLAIN and friends cannot be a CTE body; their columns are textual.
async fn text_rows(conn: &mut PgConnection, sql: &str, width: usize) -> Result<Vec<Vec<Value>>, String> {
    let rows = sqlx::query(sql).fetch_all(conn).await.map_err(|e| e.to_string())?;
    rows.iter()
        .map(|row| {
            (0..width)
                .map(|i| {
                    row.try_get::<Option<String>, _>(i)
                        .map(|v| v.map(Value::String).unwrap_or(Value::Null))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

/// Statements that may appear as a CTE body.
fn wraps_as_subquery(sql: &str) -> bool {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(first.as_str(), "SELECT" | "WITH" | "VALUES" | "TABLE")
        || sql.to_ascii_uppercase().contains("RETURNING")
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Decodes one `row_to_json` image positionally. NUMERIC cells keep their exact
/// decimal text as a string; every other cell is plain json.
fn row_values(image: &str, columns: &[ColumnMeta]) -> Result<Vec<Value>, serde_json::Error> {
    let OrderedRow(cells) = serde_json::from_str(image)?;
    cells
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let text = raw.get();
            let numeric = columns.get(i).map_or(false, |c| c.r#type == "NUMERIC");
            // NaN and Infinity already arrive quoted
            if numeric && text != "null" && !text.starts_with('"') {
                Ok(Value::String(text.to_string()))
            } else {
                serde_json::from_str(text)
            }
        })
        .collect()
}

/// Raw cells of a json object in key order, duplicate keys included.
struct OrderedRow(Vec<Box<RawValue>>);

impl<'de> Deserialize<'de> for OrderedRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = OrderedRow;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a json object row image")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<OrderedRow, A::Error> {
                let mut values = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((_, value)) = map.next_entry::<serde::de::IgnoredAny, Box<RawValue>>()? {
                    values.push(value);
                }
                Ok(OrderedRow(values))
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}
