//! Write-through backing for the relay duplicate cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    db::Store,
    error::StoreError,
    models::{to_ms, SeenMessageRecord, SeenMessageRow},
};

#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn record_seen(&self, record: &SeenMessageRecord) -> Result<(), StoreError>;

    async fn seen_since(&self, since: DateTime<Utc>) -> Result<Vec<SeenMessageRecord>, StoreError>;

    /// Delete records older than `cutoff`; returns how many.
    async fn evict_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl SeenStore for Store {
    async fn record_seen(&self, record: &SeenMessageRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO seen_messages (message_id, seen_at_ms) VALUES (?, ?)")
            .bind(&record.message_id)
            .bind(to_ms(record.seen_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn seen_since(&self, since: DateTime<Utc>) -> Result<Vec<SeenMessageRecord>, StoreError> {
        let rows: Vec<SeenMessageRow> = sqlx::query_as(
            "SELECT message_id, seen_at_ms FROM seen_messages WHERE seen_at_ms >= ? ORDER BY seen_at_ms",
        )
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SeenMessageRecord::from).collect())
    }

    async fn evict_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM seen_messages WHERE seen_at_ms < ?")
            .bind(to_ms(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
