use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;

use crate::{access::AccessProfile, config::AppConfig, db::build_pool, error::AppError};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub access_cache: Cache<i64, AccessProfile>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, AppError> {
        let db_pool = build_pool(&config).map_err(|error| {
            AppError::Dependency(format!("Could not configure database pool: {error}"))
        })?;
        if db_pool.is_none() {
            tracing::warn!("DATABASE_URL is not set; data endpoints will return 503");
        }

        Ok(Self::with_pool(config, db_pool))
    }

    pub fn with_pool(config: AppConfig, db_pool: Option<PgPool>) -> Self {
        let access_cache = Cache::builder()
            .max_capacity(config.access_cache_max_entries)
            .time_to_live(Duration::from_secs(config.access_cache_ttl_seconds.max(1)))
            .build();

        Self {
            config: Arc::new(config),
            db_pool,
            access_cache,
        }
    }

    pub fn db_pool(&self) -> Result<&PgPool, AppError> {
        self.db_pool.as_ref().ok_or_else(|| {
            AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
        })
    }
}
