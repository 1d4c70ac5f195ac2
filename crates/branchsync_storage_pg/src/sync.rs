//! Truncate-and-copy synchronization of one branch's public data onto another.
//!
//! Phases, strictly in order:
//! 1. safety checkpoint on the target
//! 2. open a repeatable-read snapshot on the source and enumerate its tables
//! 3. advisory lock on the target
//! 4. target transaction with triggers and FK enforcement off
//! 5. truncate every table
//! 6. stream rows through a server-side cursor in batches and bulk insert them
//! 7. restore sequence counters
//! 8. re-enable triggers, commit, release the lock
//!
//! Any failure in 4..=7 rolls the target transaction back before the error is
//! returned; the safety checkpoint stays available either way. When the deadline
//! expires the statement still running on the target is cancelled first. Exactly one terminal
//! event (`Done` or `Error`) reaches the sink per call.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use branchsync_core::{
    Branch, CheckpointId, EngineError, Phase, ProgressSink, SyncEvent, SyncReport, TableCopy,
};
use chrono::Utc;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Connection, Postgres, Transaction};
use tracing::{info, instrument, warn};

use crate::checkpoints::CheckpointStore;
use crate::ident::{column_list, qualified, quote_ident};
use crate::lock::{AdvisoryLock, SYNC_LOCK_KEY};
use crate::registry::BranchRegistry;
use crate::util::{db_err, rollback_quietly};

const SYNC_SCHEMA: &str = "public";
const CURSOR_NAME: &str = "branchsync_copy";

/// One sync invocation. `sink` is optional: without it the sync behaves identically,
/// only silently.
#[derive(Clone, Copy)]
pub struct SyncRequest<'a> {
    pub from: Branch,
    pub to: Branch,
    pub actor: Option<&'a str>,
    pub sink: Option<&'a dyn ProgressSink>,
}

impl<'a> SyncRequest<'a> {
    pub fn new(from: Branch, to: Branch) -> Self {
        Self { from, to, actor: None, sink: None }
    }

    pub fn actor(mut self, actor: &'a str) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn sink(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl std::fmt::Debug for SyncRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRequest")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("actor", &self.actor)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub lock_timeout: Duration,
    pub deadline: Duration,
    pub excluded_tables: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SyncEngine {
    registry: Arc<BranchRegistry>,
    checkpoints: CheckpointStore,
    settings: SyncSettings,
}

/// Failure annotated with where it happened and what the operator can roll back to.
struct SyncFailure {
    phase: Phase,
    error: EngineError,
    safety_checkpoint: Option<CheckpointId>,
}

impl SyncFailure {
    fn into_error(self) -> EngineError {
        match self.error {
            EngineError::Database(message) if self.phase.is_transactional() => {
                EngineError::Transaction {
                    phase: self.phase,
                    message,
                    safety_checkpoint: self.safety_checkpoint,
                }
            }
            other => other,
        }
    }
}

struct Progress<'a>(Option<&'a dyn ProgressSink>);

impl Progress<'_> {
    fn emit(&self, event: SyncEvent) {
        if let Some(sink) = self.0 {
            sink.emit(&event);
        }
    }
}

impl SyncEngine {
    pub fn new(registry: Arc<BranchRegistry>) -> Self {
        let cfg = registry.config();
        let settings = SyncSettings {
            batch_size: cfg.batch_size,
            lock_timeout: cfg.lock_timeout,
            deadline: cfg.sync_deadline,
            excluded_tables: cfg.excluded_tables.clone(),
        };
        Self::with_settings(registry, settings)
    }

    pub fn with_settings(registry: Arc<BranchRegistry>, settings: SyncSettings) -> Self {
        Self {
            checkpoints: CheckpointStore::new(registry.clone()),
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    #[instrument(skip(self, request), fields(from = %request.from, to = %request.to))]
    pub async fn sync(&self, request: SyncRequest<'_>) -> Result<SyncReport, EngineError> {
        let progress = Progress(request.sink);
        match self.run(&request, &progress).await {
            Ok(report) => {
                info!(
                    checkpoint = %report.checkpoint_id,
                    tables = report.tables.len(),
                    rows = report.total_rows(),
                    "sync complete"
                );
                progress.emit(SyncEvent::Done { checkpoint_id: report.checkpoint_id });
                Ok(report)
            }
            Err(failure) => {
                progress.emit(SyncEvent::failed(failure.phase, &failure.error, failure.safety_checkpoint));
                warn!(
                    phase = %failure.phase,
                    safety_checkpoint = ?failure.safety_checkpoint,
                    error = %failure.error,
                    "sync failed"
                );
                Err(failure.into_error())
            }
        }
    }

    async fn run(&self, request: &SyncRequest<'_>, progress: &Progress<'_>) -> Result<SyncReport, SyncFailure> {
        let (from, to) = (request.from, request.to);
        let fail = |phase: Phase, checkpoint: Option<CheckpointId>| {
            move |error: EngineError| SyncFailure { phase, error, safety_checkpoint: checkpoint }
        };

        if from == to {
            return Err(fail(Phase::Validate, None)(EngineError::InvalidArgument(format!(
                "cannot sync branch {from} onto itself"
            ))));
        }
        let source = self.registry.resolve(from).map_err(fail(Phase::Validate, None))?;
        let target = self.registry.resolve(to).map_err(fail(Phase::Validate, None))?;
        progress.emit(SyncEvent::Started { from, to });

        // 1
        let label = format!("auto: pre-sync from {from} ({})", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
        let notes = format!("Automatic safety checkpoint taken before syncing {from} -> {to}");
        let checkpoint_id = self
            .checkpoints
            .create(to, &label, Some(&notes), request.actor)
            .await
            .map_err(fail(Phase::SafetyCheckpoint, None))?;
        progress.emit(SyncEvent::CheckpointCreated { checkpoint_id });
        let saved = Some(checkpoint_id);

        // 2
        let mut snapshot = SourceSnapshot::open(source, from)
            .await
            .map_err(fail(Phase::EnumerateTables, saved))?;
        let source_tables = snapshot
            .tables(&self.settings.excluded_tables)
            .await
            .map_err(fail(Phase::EnumerateTables, saved))?;
        progress.emit(SyncEvent::Tables { tables: source_tables.clone() });

        // 3
        let mut lock = AdvisoryLock::acquire(target, to, SYNC_LOCK_KEY, self.settings.lock_timeout)
            .await
            .map_err(fail(Phase::AcquireLock, saved))?;
        progress.emit(SyncEvent::LockAcquired);

        // 4..=8
        let copied = self.copy_locked(target, &mut lock, &mut snapshot, &source_tables, progress).await;
        lock.release().await;
        snapshot.close().await;

        let (tables, sequences_restored) = copied.map_err(|(phase, error)| fail(phase, saved)(error))?;
        Ok(SyncReport { checkpoint_id, tables, sequences_restored })
    }

    /// Owns the target transaction: commits on success, rolls back explicitly on any
    /// failure or when the deadline expires.
    async fn copy_locked(
        &self,
        target: &PgPool,
        lock: &mut AdvisoryLock,
        snapshot: &mut SourceSnapshot<'_>,
        tables: &[String],
        progress: &Progress<'_>,
    ) -> Result<(Vec<TableCopy>, usize), (Phase, EngineError)> {
        let to = lock.branch();
        let conn = lock.connection().map_err(|e| (Phase::BeginTransaction, e))?;
        let mut tx = conn
            .begin()
            .await
            .map_err(|e| (Phase::BeginTransaction, db_err(format!("begin on {to}"))(e)))?;

        let backend: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| (Phase::BeginTransaction, db_err(format!("begin on {to}"))(e)))?;

        let phase = Mutex::new(Phase::DisableTriggers);
        let work = self.copy_in_transaction(&mut tx, snapshot, tables, progress, &phase);
        let outcome = match tokio::time::timeout(self.settings.deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                // the abandoned statement may still be blocked server side; cancel it
                // so the rollback below does not wait behind it
                cancel_backend(target, backend).await;
                Err(EngineError::Timeout(format!(
                    "sync deadline of {}ms exceeded",
                    self.settings.deadline.as_millis()
                )))
            }
        };
        let failed_in = phase.lock().map(|p| *p).unwrap_or(Phase::CopyRows);

        match outcome {
            Ok(copied) => {
                tx.commit()
                    .await
                    .map_err(|e| (Phase::Commit, db_err(format!("commit on {to}"))(e)))?;
                Ok(copied)
            }
            Err(e) => {
                rollback_quietly(tx, "sync copy").await;
                Err((failed_in, e))
            }
        }
    }

    async fn copy_in_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        snapshot: &mut SourceSnapshot<'_>,
        tables: &[String],
        progress: &Progress<'_>,
        phase: &Mutex<Phase>,
    ) -> Result<(Vec<TableCopy>, usize), EngineError> {
        let enter = |p: Phase| {
            if let Ok(mut current) = phase.lock() {
                *current = p;
            }
        };
        let target: &mut PgConnection = &mut **tx;

        // 4
        enter(Phase::DisableTriggers);
        set_replication_role(target, "replica").await?;

        // 5
        enter(Phase::Truncate);
        let target_tables: HashSet<String> = list_tables(&mut *target, &[]).await?.into_iter().collect();
        let tables: Vec<&String> = tables
            .iter()
            .filter(|t| {
                let present = target_tables.contains(*t);
                if !present {
                    warn!(table = %t, "table missing on target; skipped");
                }
                present
            })
            .collect();
        if !tables.is_empty() {
            let names: Vec<String> = tables.iter().map(|t| qualified(SYNC_SCHEMA, t)).collect();
            sqlx::query(&format!("TRUNCATE TABLE {} CASCADE", names.join(", ")))
                .execute(&mut *target)
                .await
                .map_err(db_err("truncate target tables"))?;
        }
        progress.emit(SyncEvent::Truncated { tables: tables.len() });

        // 6
        enter(Phase::CopyRows);
        let mut copies = Vec::with_capacity(tables.len());
        for table in tables {
            progress.emit(SyncEvent::TableStart { table: table.clone() });
            let rows = self.copy_table(snapshot, &mut *target, table, progress).await?;
            progress.emit(SyncEvent::TableDone { table: table.clone(), rows });
            copies.push(TableCopy { table: table.clone(), rows });
        }

        // 7
        enter(Phase::RestoreSequences);
        let restored = restore_sequences(snapshot, &mut *target).await?;
        progress.emit(SyncEvent::SequencesRestored { count: restored });

        // 8
        enter(Phase::Commit);
        set_replication_role(target, "origin").await?;
        Ok((copies, restored))
    }

    async fn copy_table(
        &self,
        snapshot: &mut SourceSnapshot<'_>,
        target: &mut PgConnection,
        table: &str,
        progress: &Progress<'_>,
    ) -> Result<u64, EngineError> {
        let source_columns = table_columns(snapshot.conn(), table).await?;
        let target_columns = table_columns(&mut *target, table).await?;
        let columns = common_columns(&target_columns, &source_columns);
        if columns.is_empty() {
            warn!(%table, "no columns in common; table left empty");
            return Ok(0);
        }

        let relation = qualified(SYNC_SCHEMA, table);
        let declare = format!(
            "DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR SELECT to_json(t)::text FROM (SELECT {} FROM {relation}) AS t",
            column_list(&columns, None)
        );
        let fetch = format!("FETCH FORWARD {} FROM {CURSOR_NAME}", self.settings.batch_size);
        let insert = format!(
            "INSERT INTO {relation} ({cols}) OVERRIDING SYSTEM VALUE \
             SELECT {cols} FROM json_populate_recordset(NULL::{relation}, $1::json)",
            cols = column_list(&columns, None)
        );

        sqlx::query(&declare)
            .execute(snapshot.conn())
            .await
            .map_err(db_err(format!("open cursor on {table}")))?;

        let mut copied: u64 = 0;
        loop {
            // row images stay text end to end so json columns survive byte for byte
            let batch: Vec<String> = sqlx::query_scalar(&fetch)
                .fetch_all(snapshot.conn())
                .await
                .map_err(db_err(format!("fetch batch from {table}")))?;
            if batch.is_empty() {
                break;
            }
            let n = batch.len() as u64;
            sqlx::query(&insert)
                .bind(json_array(&batch))
                .execute(&mut *target)
                .await
                .map_err(db_err(format!("insert batch into {table}")))?;
            copied += n;
            progress.emit(SyncEvent::TableProgress { table: table.to_string(), rows: copied });
        }

        sqlx::query(&format!("CLOSE {CURSOR_NAME}"))
            .execute(snapshot.conn())
            .await
            .map_err(db_err(format!("close cursor on {table}")))?;
        info!(%table, rows = copied, "table copied");
        Ok(copied)
    }
}

/// Read-only repeatable-read transaction on the source: enumeration, row streaming
/// and sequence reads all observe one snapshot.
struct SourceSnapshot<'p> {
    tx: Transaction<'p, Postgres>,
}

impl SourceSnapshot<'static> {
    async fn open(pool: &PgPool, branch: Branch) -> Result<Self, EngineError> {
        let mut tx = pool.begin().await.map_err(db_err(format!("begin snapshot on {branch}")))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err(format!("set snapshot isolation on {branch}")))?;
        Ok(Self { tx })
    }
}

impl SourceSnapshot<'_> {
    fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }

    async fn tables(&mut self, excluded: &[String]) -> Result<Vec<String>, EngineError> {
        list_tables(self.conn(), excluded).await
    }

    async fn close(self) {
        rollback_quietly(self.tx, "source snapshot").await;
    }
}

/// Best effort: a failed cancel only means the rollback waits for the statement.
async fn cancel_backend(pool: &PgPool, pid: i32) {
    match sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)").bind(pid).fetch_one(pool).await {
        Ok(true) => info!(pid, "cancelled sync statement after deadline"),
        Ok(false) => {}
        Err(e) => warn!(pid, error = %e, "could not cancel sync statement"),
    }
}

async fn set_replication_role(conn: &mut PgConnection, role: &str) -> Result<(), EngineError> {
    sqlx::query("SELECT set_config('session_replication_role', $1, true)")
        .bind(role)
        .execute(conn)
        .await
        .map_err(db_err(format!("set session_replication_role to {role}")))?;
    Ok(())
}

/// Base tables of the sync schema, by name.
async fn list_tables(conn: &mut PgConnection, excluded: &[String]) -> Result<Vec<String>, EngineError> {
    sqlx::query_scalar(
        r#"
        SELECT table_name::text
        FROM information_schema.tables
        WHERE table_schema = $1
          AND table_type = 'BASE TABLE'
          AND NOT (table_name::text = ANY ($2))
        ORDER BY table_name
        "#,
    )
    .bind(SYNC_SCHEMA)
    .bind(excluded)
    .fetch_all(conn)
    .await
    .map_err(db_err("enumerate tables"))
}

/// Insertable (non-generated) columns in ordinal order.
async fn table_columns(conn: &mut PgConnection, table: &str) -> Result<Vec<String>, EngineError> {
    sqlx::query_scalar(
        r#"
        SELECT column_name::text
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2 AND is_generated = 'NEVER'
        ORDER BY ordinal_position
        "#,
    )
    .bind(SYNC_SCHEMA)
    .bind(table)
    .fetch_all(conn)
    .await
    .map_err(db_err(format!("columns of {table}")))
}

/// Joins json row images into one json array without re-encoding them.
pub(crate) fn json_array(rows: &[String]) -> String {
    let mut out = String::with_capacity(rows.iter().map(|r| r.len() + 1).sum::<usize>() + 2);
    out.push('[');
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(row);
    }
    out.push(']');
    out
}

/// Target columns that also exist on the source, in target order.
pub(crate) fn common_columns(target: &[String], source: &[String]) -> Vec<String> {
    let source: HashSet<&str> = source.iter().map(String::as_str).collect();
    target.iter().filter(|c| source.contains(c.as_str())).cloned().collect()
}

struct SequenceState {
    name: String,
    last_value: Option<i64>,
    start_value: i64,
}

/// Copies every source sequence position onto the same-named target sequence.
async fn restore_sequences(
    snapshot: &mut SourceSnapshot<'_>,
    target: &mut PgConnection,
) -> Result<usize, EngineError> {
    let rows: Vec<(String, Option<i64>, i64)> = sqlx::query_as(
        r#"
        SELECT sequencename::text, last_value, start_value
        FROM pg_sequences
        WHERE schemaname = $1
        ORDER BY sequencename
        "#,
    )
    .bind(SYNC_SCHEMA)
    .fetch_all(snapshot.conn())
    .await
    .map_err(db_err("read source sequences"))?;
    let sequences: Vec<SequenceState> = rows
        .into_iter()
        .map(|(name, last_value, start_value)| SequenceState { name, last_value, start_value })
        .collect();

    let existing: HashSet<String> = sqlx::query_scalar::<_, String>(
        "SELECT sequencename::text FROM pg_sequences WHERE schemaname = $1",
    )
    .bind(SYNC_SCHEMA)
    .fetch_all(&mut *target)
    .await
    .map_err(db_err("read target sequences"))?
    .into_iter()
    .collect();

    let mut restored = 0;
    for seq in sequences {
        if !existing.contains(&seq.name) {
            warn!(sequence = %seq.name, "sequence missing on target; skipped");
            continue;
        }
        let regclass = qualified(SYNC_SCHEMA, &seq.name);
        // never-called sequences go back to their start with is_called = false
        let (value, is_called) = match seq.last_value {
            Some(v) => (v, true),
            None => (seq.start_value, false),
        };
        sqlx::query("SELECT setval($1::regclass, $2, $3)")
            .bind(&regclass)
            .bind(value)
            .bind(is_called)
            .execute(&mut *target)
            .await
            .map_err(db_err(format!("setval {}", quote_ident(&seq.name))))?;
        restored += 1;
    }
    Ok(restored)
}
