use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Connections kept for request handlers and settling sessions.
const MAX_CONNECTIONS: u32 = 10;

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Connects and brings the schema up to date.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(
            "Database migrations applied (pool size {})",
            MAX_CONNECTIONS
        );

        Ok(Self { pool })
    }
}
