use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use sner_core::config::DatabaseConfig;
use sner_core::errors::SnerResult;

/// Build the connection pool and run embedded migrations.
pub async fn create_pool(config: &DatabaseConfig) -> SnerResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .connect(&config.url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(sqlx::Error::from)?;

    info!("database connected");
    Ok(pool)
}
