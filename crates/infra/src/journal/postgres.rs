//! Postgres-backed delivery journal.
//!
//! One row per abandoned record, keyed by `(partition, source_offset)`; the
//! full delivery record is stored as JSONB.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::instrument;

use async_trait::async_trait;
use orderflow_core::PartitionId;

use super::{DeliveryJournal, JournalError};
use crate::delivery::DeliveryRecord;

#[derive(Debug, Clone)]
pub struct PostgresDeliveryJournal {
    pool: Arc<PgPool>,
}

impl PostgresDeliveryJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JournalError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let journal = Self::new(pool);
        journal.ensure_schema().await?;
        Ok(journal)
    }

    pub async fn ensure_schema(&self) -> Result<(), JournalError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_journal (
                partition_id INTEGER NOT NULL,
                source_offset BIGINT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                record JSONB NOT NULL,
                persisted_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (partition_id, source_offset)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryJournal for PostgresDeliveryJournal {
    #[instrument(skip(self, records), fields(partition = %partition, count = records.len()), err)]
    async fn persist(&self, partition: PartitionId, records: &[DeliveryRecord]) -> Result<(), JournalError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM delivery_journal WHERE partition_id = $1")
            .bind(partition.get() as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_partition", e))?;

        let persisted_at = Utc::now();
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO delivery_journal (
                    partition_id, source_offset, state, attempts, record, persisted_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(partition.get() as i32)
            .bind(record.offset().get() as i64)
            .bind(record.state.label())
            .bind(record.attempts as i32)
            .bind(serde_json::to_value(record)?)
            .bind(persisted_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_record", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(partition = %partition), err)]
    async fn load(&self, partition: PartitionId) -> Result<Vec<DeliveryRecord>, JournalError> {
        let rows = sqlx::query(
            r#"
            SELECT record
            FROM delivery_journal
            WHERE partition_id = $1
            ORDER BY source_offset ASC
            "#,
        )
        .bind(partition.get() as i32)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.try_get("record").map_err(|e| map_sqlx_error("load", e))?;
            records.push(serde_json::from_value(value)?);
        }
        Ok(records)
    }

    async fn clear(&self, partition: PartitionId) -> Result<(), JournalError> {
        sqlx::query("DELETE FROM delivery_journal WHERE partition_id = $1")
            .bind(partition.get() as i32)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> JournalError {
    let message = match err {
        sqlx::Error::Database(db_err) => format!("database error: {}", db_err.message()),
        sqlx::Error::PoolClosed => "connection pool closed".to_string(),
        other => other.to_string(),
    };
    JournalError::Storage { operation, message }
}
