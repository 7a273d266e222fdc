//! PostgreSQL implementation of [`OutcomeStore`].
//!
//! Uses the `conversions` and `users` tables created by the crate's migrations (see
//! [`crate::migrator`]).

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::postgres::PgPool;

use super::{ConversionOutcome, OutcomeStore};
use crate::domain::batch::SubmitterId;
use crate::error::{Result, VolleyError};

/// Outcome store backed by PostgreSQL.
///
/// # Example
/// ```ignore
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/volley").await?;
/// volley::migrator().run(&pool).await?;
/// let outcomes = PostgresOutcomeStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresOutcomeStore {
    pool: PgPool,
}

impl PostgresOutcomeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Set or clear the ban flag for a submitter, creating their row if needed.
    pub async fn set_banned(&self, submitter: SubmitterId, banned: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, is_banned)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET is_banned = EXCLUDED.is_banned
            "#,
        )
        .bind(submitter.0)
        .bind(banned)
        .execute(&self.pool)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to update ban flag: {}", e)))?;
        Ok(())
    }

    /// Number of successful conversions recorded for a submitter.
    pub async fn total_conversions(&self, submitter: SubmitterId) -> Result<i64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT total_conversions FROM users WHERE user_id = $1")
                .bind(submitter.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    VolleyError::Other(anyhow!("Failed to read conversion count: {}", e))
                })?;
        Ok(total.unwrap_or(0))
    }
}

#[async_trait]
impl OutcomeStore for PostgresOutcomeStore {
    async fn record_outcome(&self, outcome: &ConversionOutcome) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO conversions (user_id, file_name, file_size, success, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(outcome.submitter.0)
        .bind(&outcome.filename)
        .bind(outcome.size as i64)
        .bind(outcome.success)
        .bind(outcome.error.as_deref())
        .bind(outcome.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| VolleyError::Other(anyhow!("Failed to record conversion: {}", e)))?;

        if outcome.success {
            sqlx::query(
                r#"
                INSERT INTO users (user_id, total_conversions)
                VALUES ($1, 1)
                ON CONFLICT (user_id) DO UPDATE
                SET total_conversions = users.total_conversions + 1
                "#,
            )
            .bind(outcome.submitter.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| VolleyError::Other(anyhow!("Failed to bump conversion count: {}", e)))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn is_banned(&self, submitter: SubmitterId) -> Result<bool> {
        let banned: Option<bool> =
            sqlx::query_scalar("SELECT is_banned FROM users WHERE user_id = $1")
                .bind(submitter.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(banned.unwrap_or(false))
    }
}
