//! Response log on Postgres.

use async_trait::async_trait;

use super::Db;
use crate::error::Result;
use crate::model::*;
use crate::store::ResponseLog;

#[async_trait]
impl ResponseLog for Db {
    async fn record_response(&self, response: &ResponseMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO responses (correlation_id, thread_id, success, error_kind, body, recorded_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (correlation_id) DO NOTHING",
        )
        .bind(response.correlation_id.0)
        .bind(response.thread_id.0)
        .bind(response.success)
        .bind(response.error_kind.map(|k| k.as_str()))
        .bind(serde_json::to_value(response)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn find_response(&self, correlation_id: CorrelationId) -> Result<Option<ResponseMessage>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT body FROM responses WHERE correlation_id = $1")
                .bind(correlation_id.0)
                .fetch_optional(self.pool())
                .await?;
        row.map(|(body,)| serde_json::from_value(body).map_err(Into::into))
            .transpose()
    }
}

