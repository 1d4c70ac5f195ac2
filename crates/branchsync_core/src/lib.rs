//! Branchsync core
//! Domain types, error taxonomy and ports shared by the branch registry, checkpoint
//! store, rollback executor, sync engine and query gateway. No database driver here;
//! adapters (see `branchsync_storage_pg`) depend on this crate, never the reverse.

pub mod events;
pub mod guard;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use events::{
    ChannelSink, FnSink, NoopSink, ProgressSink, RecordingSink, SyncEvent, TracingSink,
};
pub use guard::{ensure_read_only, Confirmation};

pub type EngineResult<T> = Result<T, EngineError>;

// -----------------------
// Branches
// -----------------------

/// Logical database environment. The set is closed: anything else is a config error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Dev,
    Prod,
}

impl Branch {
    pub const ALL: [Branch; 2] = [Branch::Dev, Branch::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::Dev => "dev",
            Branch::Prod => "prod",
        }
    }

    /// Environment variable holding this branch's connection string.
    pub fn env_var(&self) -> &'static str {
        match self {
            Branch::Dev => "DEV_DATABASE_URL",
            Branch::Prod => "PROD_DATABASE_URL",
        }
    }

    /// Destructive actions aimed at a protected branch need a typed confirmation.
    pub fn is_protected(&self) -> bool {
        matches!(self, Branch::Prod)
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Branch {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Branch::Dev),
            "prod" => Ok(Branch::Prod),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown branch '{other}' (expected 'dev' or 'prod')"
            ))),
        }
    }
}

impl TryFrom<&str> for Branch {
    type Error = EngineError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Health snapshot of one branch, for diagnostics only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchStatus {
    pub branch: Branch,
    pub configured: bool,
    pub reachable: bool,
}

// -----------------------
// Checkpoints
// -----------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub Uuid);

impl CheckpointId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CheckpointId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(CheckpointId)
            .map_err(|e| EngineError::InvalidArgument(format!("checkpoint id '{s}': {e}")))
    }
}

impl From<Uuid> for CheckpointId {
    fn from(value: Uuid) -> Self {
        CheckpointId(value)
    }
}

/// Immutable capture of a branch's table contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub branch: Branch,
    pub label: String,
    pub schema_name: Vec<String>,
    pub notes: Option<String>,
    /// `None` for system-triggered checkpoints.
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row count captured for one table of a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointTable {
    pub schema_name: String,
    pub table_name: String,
    pub row_count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRow {
    pub table_name: String,
    pub current_count: i64,
    pub checkpoint_count: i64,
    pub delta: i64,
}

impl DiffRow {
    pub fn new(table_name: impl Into<String>, current_count: i64, checkpoint_count: i64) -> Self {
        Self {
            table_name: table_name.into(),
            current_count,
            checkpoint_count,
            delta: current_count - checkpoint_count,
        }
    }
}

/// True when every table matches its captured count.
pub fn diff_is_clean(rows: &[DiffRow]) -> bool {
    rows.iter().all(|r| r.delta == 0)
}

// -----------------------
// Sync results
// -----------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCopy {
    pub table: String,
    pub rows: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Safety checkpoint taken on the target before truncation.
    pub checkpoint_id: CheckpointId,
    pub tables: Vec<TableCopy>,
    pub sequences_restored: usize,
}

impl SyncReport {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// Ordered steps of a sync (and the single restore step of a rollback).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Validate,
    SafetyCheckpoint,
    EnumerateTables,
    AcquireLock,
    BeginTransaction,
    DisableTriggers,
    Truncate,
    CopyRows,
    RestoreSequences,
    Commit,
    Restore,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::SafetyCheckpoint => "safety-checkpoint",
            Phase::EnumerateTables => "enumerate-tables",
            Phase::AcquireLock => "acquire-lock",
            Phase::BeginTransaction => "begin-transaction",
            Phase::DisableTriggers => "disable-triggers",
            Phase::Truncate => "truncate",
            Phase::CopyRows => "copy-rows",
            Phase::RestoreSequences => "restore-sequences",
            Phase::Commit => "commit",
            Phase::Restore => "restore",
        }
    }

    /// Phases that run inside the target transaction.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            Phase::BeginTransaction
                | Phase::DisableTriggers
                | Phase::Truncate
                | Phase::CopyRows
                | Phase::RestoreSequences
                | Phase::Commit
                | Phase::Restore
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------
// Introspection / query gateway types
// -----------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub table_type: String,
    pub size_bytes: i64,
    /// Planner estimate, not an exact count.
    pub row_estimate: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub default: Option<String>,
    pub ordinal: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub r#type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: u64,
    pub duration_ms: u64,
}

/// Outcome of an ad-hoc diagnostic query. Failures are data, not errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum QueryOutcome {
    Success(QueryResult),
    #[serde(rename_all = "camelCase")]
    Failure { error: String, duration_ms: u64 },
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryOutcome::Success(_))
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            QueryOutcome::Success(r) => r.duration_ms,
            QueryOutcome::Failure { duration_ms, .. } => *duration_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: i64,
    pub hash: String,
    /// Epoch millis as recorded by the migration tool.
    pub created_at: i64,
}

// -----------------------
// Errors
// -----------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transaction failed during {phase}: {message}")]
    Transaction {
        phase: Phase,
        message: String,
        safety_checkpoint: Option<CheckpointId>,
    },
    #[error("lock contention: {0}")]
    LockContention(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("database error: {0}")]
    Database(String),
}

impl EngineError {
    /// Phase a transactional failure happened in, when known.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            EngineError::Transaction { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Checkpoint an operator can roll back to after this failure, if any.
    pub fn safety_checkpoint(&self) -> Option<CheckpointId> {
        match self {
            EngineError::Transaction { safety_checkpoint, .. } => *safety_checkpoint,
            _ => None,
        }
    }

    /// Retrying will not help: the caller has to fix input or configuration.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_) | EngineError::InvalidArgument(_) | EngineError::NotFound(_)
        )
    }
}
