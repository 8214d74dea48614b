//! Postgres backend: connection pool, migrations, and health check.
//!
//! `Db` implements every trait in [`crate::store`]: pgmq queues, the
//! ownership registry, thread rows, and the response log.

pub mod claims;
pub mod pgmq;
pub mod responses;
pub mod threads;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::Mutex;

/// NOTIFY channel signalled whenever a message is sent.
pub const READY_CHANNEL: &str = "mailroom_ready";

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
    listener: Mutex<Option<PgListener>>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            listener: Mutex::new(None),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
