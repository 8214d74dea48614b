//! Ownership registry on Postgres.
//!
//! Claim acquisition is a single `INSERT ... ON CONFLICT DO UPDATE ... WHERE`
//! statement: the row is written only if none exists or the existing one is
//! released or past its lease. Lease arithmetic uses the database clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use uuid::Uuid;

use super::Db;
use crate::error::Result;
use crate::model::*;
use crate::store::OwnershipRegistry;
use crate::telemetry::metrics;

const CLAIM_COLUMNS: &str = "project_id, user_id, owner_id, claim_token, claimed_at, lease_expires_at, released_at, input_queue, output_queue";

#[async_trait]
impl OwnershipRegistry for Db {
    async fn try_claim(
        &self,
        pair: &PairKey,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimResult> {
        let sql = format!(
            "INSERT INTO ownership_claims ({CLAIM_COLUMNS})
             VALUES ($1, $2, $3, $4, now(), now() + make_interval(secs => $5), NULL, $6, $7)
             ON CONFLICT (project_id, user_id) DO UPDATE SET
                 owner_id = EXCLUDED.owner_id,
                 claim_token = EXCLUDED.claim_token,
                 claimed_at = EXCLUDED.claimed_at,
                 lease_expires_at = EXCLUDED.lease_expires_at,
                 released_at = NULL,
                 input_queue = EXCLUDED.input_queue,
                 output_queue = EXCLUDED.output_queue
             WHERE ownership_claims.released_at IS NOT NULL
                OR ownership_claims.lease_expires_at <= now()
             RETURNING {CLAIM_COLUMNS}"
        );
        let acquired: Option<ClaimRow> = sqlx::query_as(&sql)
            .bind(&pair.project_id)
            .bind(&pair.user_id)
            .bind(worker.as_str())
            .bind(Uuid::new_v4())
            .bind(lease.as_secs_f64())
            .bind(pair.input_queue())
            .bind(pair.output_queue())
            .fetch_optional(self.pool())
            .await?;

        if let Some(row) = acquired {
            metrics::claims().add(1, &[KeyValue::new("result", "acquired")]);
            return Ok(ClaimResult::Acquired(row.into()));
        }

        // Diagnostic read only; never used to decide ownership.
        let owner: Option<(String,)> = sqlx::query_as(
            "SELECT owner_id FROM ownership_claims WHERE project_id = $1 AND user_id = $2",
        )
        .bind(&pair.project_id)
        .bind(&pair.user_id)
        .fetch_optional(self.pool())
        .await?;

        metrics::claims().add(1, &[KeyValue::new("result", "already_owned")]);
        Ok(ClaimResult::AlreadyOwned {
            owner: WorkerId::new(owner.map(|o| o.0).unwrap_or_default()),
        })
    }

    async fn renew(&self, ctx: &ClaimContext, lease: Duration) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE ownership_claims SET lease_expires_at = now() + make_interval(secs => $1)
             WHERE project_id = $2 AND user_id = $3 AND owner_id = $4 AND claim_token = $5
               AND released_at IS NULL AND lease_expires_at > now()",
        )
        .bind(lease.as_secs_f64())
        .bind(&ctx.pair.project_id)
        .bind(&ctx.pair.user_id)
        .bind(ctx.worker_id.as_str())
        .bind(ctx.claim_token.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        let result = if rows_affected == 1 { "renewed" } else { "renew_rejected" };
        metrics::claims().add(1, &[KeyValue::new("result", result)]);
        Ok(rows_affected == 1)
    }

    async fn release(&self, ctx: &ClaimContext) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE ownership_claims SET released_at = now()
             WHERE project_id = $1 AND user_id = $2 AND owner_id = $3 AND claim_token = $4
               AND released_at IS NULL AND lease_expires_at > now()",
        )
        .bind(&ctx.pair.project_id)
        .bind(&ctx.pair.user_id)
        .bind(ctx.worker_id.as_str())
        .bind(ctx.claim_token.0)
        .execute(self.pool())
        .await?
        .rows_affected();

        let result = if rows_affected == 1 { "released" } else { "release_rejected" };
        metrics::claims().add(1, &[KeyValue::new("result", result)]);
        Ok(rows_affected == 1)
    }

    async fn is_owned_by(&self, pair: &PairKey, worker: &WorkerId) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT true FROM ownership_claims
             WHERE project_id = $1 AND user_id = $2 AND owner_id = $3
               AND released_at IS NULL AND lease_expires_at > now()",
        )
        .bind(&pair.project_id)
        .bind(&pair.user_id)
        .bind(worker.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    async fn current_claim(&self, pair: &PairKey) -> Result<Option<OwnershipClaim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS} FROM ownership_claims
             WHERE project_id = $1 AND user_id = $2
               AND released_at IS NULL AND lease_expires_at > now()"
        );
        let row: Option<ClaimRow> = sqlx::query_as(&sql)
            .bind(&pair.project_id)
            .bind(&pair.user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_claims(&self) -> Result<Vec<OwnershipClaim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS} FROM ownership_claims ORDER BY project_id, user_id"
        );
        let rows: Vec<ClaimRow> = sqlx::query_as(&sql).fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ClaimRow {
    project_id: String,
    user_id: String,
    owner_id: String,
    claim_token: Uuid,
    claimed_at: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
    input_queue: String,
    output_queue: String,
}

impl From<ClaimRow> for OwnershipClaim {
    fn from(row: ClaimRow) -> Self {
        Self {
            pair: PairKey::new(row.project_id, row.user_id),
            owner_id: WorkerId::new(row.owner_id),
            claim_token: ClaimToken(row.claim_token),
            claimed_at: row.claimed_at,
            lease_expires_at: row.lease_expires_at,
            released_at: row.released_at,
            input_queue: row.input_queue,
            output_queue: row.output_queue,
        }
    }
}
