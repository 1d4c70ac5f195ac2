use branchsync_core::EngineError;

/// Maps a driver error into the engine taxonomy, keeping `context` in the message.
pub(crate) fn db_err(context: impl std::fmt::Display) -> impl FnOnce(sqlx::Error) -> EngineError {
    move |e| match e {
        sqlx::Error::PoolTimedOut => EngineError::Timeout(format!("{context}: no pooled connection available")),
        sqlx::Error::Configuration(inner) => EngineError::Configuration(format!("{context}: {inner}")),
        other => EngineError::Database(format!("{context}: {other}")),
    }
}

/// Rolls back `tx`, logging (not returning) a failure to do so.
pub(crate) async fn rollback_quietly(tx: sqlx::Transaction<'_, sqlx::Postgres>, context: &str) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "{context}: explicit rollback failed; the server aborts the transaction on disconnect");
    }
}
