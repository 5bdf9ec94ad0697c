//! Batch outcome recorders.
//!
//! The engine hands every finished batch to an [`OutcomeRecorder`]. A recorder
//! failure is logged by the engine and never fails the dispatch call.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker;
use sqlx::PgPool;

use crate::circuit_breaker::{create_audit_circuit_breaker, AuditCircuitBreaker};
use crate::errors::{AppError, ResultExt};
use crate::models::WorkItem;
use crate::reporter::{status_label, BatchOutcome};

#[async_trait]
pub trait OutcomeRecorder: Send + Sync {
    async fn record_batch_outcome(
        &self,
        items: &[WorkItem],
        outcome: &BatchOutcome,
    ) -> Result<(), AppError>;
}

/// Writes outcomes to the log only. Used when no database is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingOutcomeRecorder;

#[async_trait]
impl OutcomeRecorder for TracingOutcomeRecorder {
    async fn record_batch_outcome(
        &self,
        items: &[WorkItem],
        outcome: &BatchOutcome,
    ) -> Result<(), AppError> {
        for result in &outcome.summary.per_item_detail {
            tracing::debug!(
                batch_id = %outcome.batch_id,
                key = %result.key,
                status = status_label(result),
                attempts = result.attempts,
                "Dispatch outcome"
            );
        }

        tracing::info!(
            batch_id = %outcome.batch_id,
            destination = %outcome.destination,
            items = items.len(),
            sent = outcome.summary.success_count,
            failed = outcome.summary.failure_count,
            "Batch outcome recorded"
        );
        Ok(())
    }
}

/// Appends one row per item to `lead_dispatch_log`, behind a circuit breaker.
#[derive(Clone)]
pub struct PgOutcomeRecorder {
    pool: PgPool,
    breaker: AuditCircuitBreaker,
}

impl PgOutcomeRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self::with_breaker(pool, create_audit_circuit_breaker())
    }

    pub fn with_breaker(pool: PgPool, breaker: AuditCircuitBreaker) -> Self {
        Self { pool, breaker }
    }

    /// Creates the audit table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lead_dispatch_log (
                id BIGSERIAL PRIMARY KEY,
                batch_id UUID NOT NULL,
                destination TEXT NOT NULL,
                lead_key TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                http_status INTEGER,
                error TEXT,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating lead_dispatch_log")?;
        Ok(())
    }

    async fn insert_rows(&self, outcome: &BatchOutcome) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        for result in &outcome.summary.per_item_detail {
            sqlx::query(
                r#"
                INSERT INTO lead_dispatch_log
                    (batch_id, destination, lead_key, status, attempts, http_status, error, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                "#,
            )
            .bind(outcome.batch_id)
            .bind(&outcome.destination)
            .bind(&result.key)
            .bind(status_label(result))
            .bind(result.attempts as i32)
            .bind(result.status.map(i32::from))
            .bind(result.error.as_deref())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("recording outcome for {}", result.key))?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OutcomeRecorder for PgOutcomeRecorder {
    async fn record_batch_outcome(
        &self,
        _items: &[WorkItem],
        outcome: &BatchOutcome,
    ) -> Result<(), AppError> {
        if outcome.summary.per_item_detail.is_empty() {
            return Ok(());
        }

        match self.breaker.call(self.insert_rows(outcome)).await {
            Ok(()) => {
                tracing::debug!(
                    batch_id = %outcome.batch_id,
                    rows = outcome.summary.per_item_detail.len(),
                    "Dispatch outcomes persisted"
                );
                Ok(())
            }
            Err(failsafe::Error::Rejected) => Err(AppError::Storage(
                "audit circuit open, outcome not persisted".to_string(),
            )),
            Err(failsafe::Error::Inner(e)) => Err(e),
        }
    }
}
