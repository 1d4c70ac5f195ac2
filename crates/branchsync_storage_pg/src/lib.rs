//! Branchsync PostgreSQL adapter
//! Branch registry, admin-schema checkpoints, transactional rollback, truncate-and-copy
//! sync between branches, and the read-mostly introspection gateway.
//!
//! Every component borrows pools from one injected [`BranchRegistry`]; nothing below
//! the registry opens its own connections.

pub mod checkpoints;
pub mod config;
pub mod gateway;
pub mod ident;
pub mod lock;
pub mod registry;
pub mod rollback;
pub mod schema;
pub mod sync;
mod util;

pub use checkpoints::CheckpointStore;
pub use config::PgConfig;
pub use gateway::QueryGateway;
pub use lock::{AdvisoryLock, SYNC_LOCK_KEY};
pub use registry::BranchRegistry;
pub use rollback::RollbackExecutor;
pub use sync::{SyncEngine, SyncRequest, SyncSettings};

pub use branchsync_core as core;
