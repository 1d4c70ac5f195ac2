//! Branch registry: one lazily-built connection pool per branch, owned here and
//! borrowed by every other component for the registry's lifetime.

use std::str::FromStr;

use branchsync_core::{Branch, BranchStatus, EngineError};
use once_cell::sync::OnceCell;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, info, instrument, warn};

use crate::config::PgConfig;

const APPLICATION_NAME: &str = "branchsync";

pub struct BranchRegistry {
    config: PgConfig,
    dev: OnceCell<PgPool>,
    prod: OnceCell<PgPool>,
}

impl std::fmt::Debug for BranchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchRegistry")
            .field("dev_pool", &self.dev.get().is_some())
            .field("prod_pool", &self.prod.get().is_some())
            .finish()
    }
}

impl BranchRegistry {
    pub fn new(config: PgConfig) -> Self {
        Self {
            config,
            dev: OnceCell::new(),
            prod: OnceCell::new(),
        }
    }

    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Self::new(PgConfig::from_env()?))
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    fn cell(&self, branch: Branch) -> &OnceCell<PgPool> {
        match branch {
            Branch::Dev => &self.dev,
            Branch::Prod => &self.prod,
        }
    }

    /// Returns the branch's pool, building it on first use. Fails with
    /// `Configuration` when the branch's connection string is not set.
    pub fn resolve(&self, branch: Branch) -> Result<&PgPool, EngineError> {
        self.cell(branch).get_or_try_init(|| self.build_pool(branch))
    }

    pub fn is_configured(&self, branch: Branch) -> bool {
        self.config.url(branch).is_some()
    }

    fn build_pool(&self, branch: Branch) -> Result<PgPool, EngineError> {
        let url = self.config.url(branch).ok_or_else(|| {
            EngineError::Configuration(format!(
                "{} is not set; branch {branch} cannot be resolved",
                branch.env_var()
            ))
        })?;
        let mut opts = PgConnectOptions::from_str(url)
            .map_err(|e| EngineError::Configuration(format!("invalid connection string for {branch}: {e}")))?
            .application_name(APPLICATION_NAME);
        if let Some(timeout) = self.config.statement_timeout {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout.as_millis()))]);
        }

        // Lazy: no connection is opened until the first query.
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_lazy_with(opts);
        info!(%branch, max_connections = self.config.max_connections, "connection pool constructed");
        Ok(pool)
    }

    /// Runs `SELECT 1`; any failure, including missing configuration, yields `false`.
    #[instrument(skip(self))]
    pub async fn test_connection(&self, branch: Branch) -> bool {
        let pool = match self.resolve(branch) {
            Ok(pool) => pool,
            Err(e) => {
                debug!(error = %e, "branch not resolvable");
                return false;
            }
        };
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%branch, error = %e, "connection test failed");
                false
            }
        }
    }

    pub async fn status(&self) -> Vec<BranchStatus> {
        let mut out = Vec::with_capacity(Branch::ALL.len());
        for branch in Branch::ALL {
            out.push(BranchStatus {
                branch,
                configured: self.is_configured(branch),
                reachable: self.test_connection(branch).await,
            });
        }
        out
    }

    /// Closes every pool built so far. Later `resolve` calls return the closed pool,
    /// whose queries fail; shutdown is meant for process exit.
    pub async fn shutdown(&self) {
        for branch in Branch::ALL {
            if let Some(pool) = self.cell(branch).get() {
                pool.close().await;
                info!(%branch, "connection pool closed");
            }
        }
    }
}
