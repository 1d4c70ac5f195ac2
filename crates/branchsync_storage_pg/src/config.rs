use std::{env, fmt::Display, str::FromStr, time::Duration};

use branchsync_core::{Branch, EngineError};
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 5000;

#[derive(Clone, Debug)]
pub struct PgConfig {
    pub dev_url: Option<String>,
    pub prod_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side `statement_timeout` for every pooled connection; `None` disables it.
    pub statement_timeout: Option<Duration>,
    /// How long sync and rollback wait for the branch's advisory lock.
    pub lock_timeout: Duration,
    /// Upper bound on the copy transaction of one sync.
    pub sync_deadline: Duration,
    pub batch_size: usize,
    /// Operational tables a data sync must never overwrite.
    pub excluded_tables: Vec<String>,
    pub migrations_schema: String,
    pub migrations_table: String,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            dev_url: None,
            prod_url: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Some(Duration::from_secs(300)),
            lock_timeout: Duration::from_secs(30),
            sync_deadline: Duration::from_secs(3600),
            batch_size: DEFAULT_BATCH_SIZE,
            excluded_tables: vec!["session".to_string()],
            migrations_schema: "drizzle".to_string(),
            migrations_table: "__drizzle_migrations".to_string(),
        }
    }
}

impl PgConfig {
    /// Loads from process environment. Missing connection strings are tolerated here;
    /// they surface when the branch is first resolved.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let url = |branch: Branch| {
            let value = lookup(branch.env_var()).filter(|v| !v.trim().is_empty());
            if value.is_none() {
                warn!("{} not set; branch {branch} is unavailable", branch.env_var());
            }
            value
        };
        let statement_timeout_ms: u64 = try_load(&lookup, "BRANCHSYNC_STATEMENT_TIMEOUT_MS", 300_000)?;

        Ok(Self {
            dev_url: url(Branch::Dev),
            prod_url: url(Branch::Prod),
            max_connections: try_load(&lookup, "BRANCHSYNC_MAX_CONNECTIONS", defaults.max_connections)?,
            statement_timeout: (statement_timeout_ms > 0).then(|| Duration::from_millis(statement_timeout_ms)),
            lock_timeout: Duration::from_millis(try_load(&lookup, "BRANCHSYNC_LOCK_TIMEOUT_MS", 30_000u64)?),
            sync_deadline: Duration::from_secs(try_load(&lookup, "BRANCHSYNC_SYNC_DEADLINE_SECS", 3600u64)?),
            batch_size: try_load(&lookup, "BRANCHSYNC_BATCH_SIZE", defaults.batch_size)?,
            ..defaults
        }
        .validated()?)
    }

    pub fn url(&self, branch: Branch) -> Option<&str> {
        match branch {
            Branch::Dev => self.dev_url.as_deref(),
            Branch::Prod => self.prod_url.as_deref(),
        }
    }

    pub fn with_url(mut self, branch: Branch, url: impl Into<String>) -> Self {
        match branch {
            Branch::Dev => self.dev_url = Some(url.into()),
            Branch::Prod => self.prod_url = Some(url.into()),
        }
        self
    }

    pub fn validated(self) -> Result<Self, EngineError> {
        if self.batch_size == 0 {
            return Err(EngineError::Configuration("batch size must be positive".into()));
        }
        if self.max_connections < 2 {
            // a sync holds the lock connection while checkpoint queries need another
            return Err(EngineError::Configuration("max_connections must be at least 2".into()));
        }
        Ok(self)
    }
}

fn try_load<F, T>(lookup: &F, key: &str, default: T) -> Result<T, EngineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
        Some(raw) => raw.trim().parse().map_err(|e| {
            warn!("Invalid {key} value: {e}");
            EngineError::Configuration(format!("{key}={raw}: {e}"))
        }),
    }
}
