use std::time::Duration;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Postgres, Transaction,
};

use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
};

/// Builds the shared pool without connecting; the first query opens a
/// connection. Returns `None` when no database URL is configured.
pub fn build_pool(config: &AppConfig) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(url) = config.database_url.as_deref() else {
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections.max(1))
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(url)?;

    Ok(Some(pool))
}

pub type PgTransaction = Transaction<'static, Postgres>;

pub async fn begin_transaction(pool: &PgPool) -> AppResult<PgTransaction> {
    pool.begin().await.map_err(|error| {
        tracing::error!(db_error = %error, "Could not begin transaction");
        AppError::Dependency("Database is unavailable.".to_string())
    })
}

/// Commits, or returns 503 when the commit itself fails. Dropping a
/// transaction without calling this rolls it back.
pub async fn commit(tx: PgTransaction) -> AppResult<()> {
    tx.commit().await.map_err(|error| {
        tracing::error!(db_error = %error, "Could not commit transaction");
        AppError::Dependency("Database is unavailable.".to_string())
    })
}
