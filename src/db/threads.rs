//! Thread rows on Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::ThreadStore;

const THREAD_COLUMNS: &str = "thread_id, origin_address, project_id, user_id, branch_name, subject, created_at, last_activity_at";

#[async_trait]
impl ThreadStore for Db {
    async fn insert_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            "INSERT INTO threads (thread_id, continuity_token, origin_address, project_id, user_id, branch_name, subject, created_at, last_activity_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(thread.thread_id.0)
        .bind(thread.continuity_token())
        .bind(&thread.origin_address)
        .bind(&thread.pair.project_id)
        .bind(&thread.pair.user_id)
        .bind(&thread.branch_name)
        .bind(&thread.subject)
        .bind(thread.created_at)
        .bind(thread.last_activity_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_thread(&self, id: ThreadId) -> Result<Option<Thread>> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_id = $1");
        let row: Option<ThreadRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Thread>> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE continuity_token = $1");
        let row: Option<ThreadRow> = sqlx::query_as(&sql)
            .bind(token)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    async fn recent_for_origin(
        &self,
        origin: &str,
        pair: &PairKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<Thread>> {
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads
             WHERE lower(origin_address) = lower($1) AND project_id = $2 AND user_id = $3
               AND last_activity_at >= $4
             ORDER BY last_activity_at DESC"
        );
        let rows: Vec<ThreadRow> = sqlx::query_as(&sql)
            .bind(origin)
            .bind(&pair.project_id)
            .bind(&pair.user_id)
            .bind(since)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn touch(&self, id: ThreadId, at: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE threads SET last_activity_at = GREATEST(last_activity_at, $1) WHERE thread_id = $2",
        )
        .bind(at)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("thread {id}")));
        }
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ThreadRow {
    thread_id: Uuid,
    origin_address: String,
    project_id: String,
    user_id: String,
    branch_name: String,
    subject: String,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl From<ThreadRow> for Thread {
    fn from(row: ThreadRow) -> Self {
        Self {
            thread_id: ThreadId(row.thread_id),
            origin_address: row.origin_address,
            pair: PairKey::new(row.project_id, row.user_id),
            branch_name: row.branch_name,
            subject: row.subject,
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
        }
    }
}
