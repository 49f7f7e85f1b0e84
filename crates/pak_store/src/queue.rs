//! Offline queue persistence. Payloads are vault-encrypted.

use async_trait::async_trait;

use crate::{
    db::Store,
    error::StoreError,
    models::{from_ms, to_ms, Priority, QueueStatus, QueuedMessage, QueuedMessageRow},
};

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert or overwrite the entry for `(message_id, peer_key)`.
    async fn save_queued(&self, msg: &QueuedMessage) -> Result<(), StoreError>;

    async fn remove_queued(&self, message_id: &str, peer_key: &str) -> Result<bool, StoreError>;

    /// Every non-terminal entry, oldest first.
    async fn load_queued(&self) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Move all entries addressed to `old_key` onto `new_key`.
    async fn rekey_queued(&self, old_key: &str, new_key: &str) -> Result<u64, StoreError>;
}

#[async_trait]
impl QueueStore for Store {
    async fn save_queued(&self, msg: &QueuedMessage) -> Result<(), StoreError> {
        let payload_enc = self.encrypt_value(&msg.payload).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO queued_messages \
                (message_id, peer_key, payload_enc, priority, status, attempts, relayed, \
                 enqueued_at_ms, next_attempt_at_ms, ack_deadline_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.message_id)
        .bind(&msg.peer_key)
        .bind(payload_enc)
        .bind(msg.priority.as_i64())
        .bind(msg.status.as_str())
        .bind(i64::from(msg.attempts))
        .bind(msg.relayed)
        .bind(to_ms(msg.enqueued_at))
        .bind(to_ms(msg.next_attempt_at))
        .bind(msg.ack_deadline.map(to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_queued(&self, message_id: &str, peer_key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM queued_messages WHERE message_id = ? AND peer_key = ?")
            .bind(message_id)
            .bind(peer_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_queued(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        let rows: Vec<QueuedMessageRow> = sqlx::query_as(
            "SELECT message_id, peer_key, payload_enc, priority, status, attempts, relayed, \
                    enqueued_at_ms, next_attempt_at_ms, ack_deadline_ms \
             FROM queued_messages \
             WHERE status NOT IN ('delivered', 'failed') \
             ORDER BY enqueued_at_ms ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(QueuedMessage {
                payload: self.decrypt_value(&row.payload_enc).await?,
                priority: Priority::from_i64(row.priority)?,
                status: QueueStatus::parse(&row.status)?,
                attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
                relayed: row.relayed,
                enqueued_at: from_ms(row.enqueued_at_ms),
                next_attempt_at: from_ms(row.next_attempt_at_ms),
                ack_deadline: row.ack_deadline_ms.map(from_ms),
                message_id: row.message_id,
                peer_key: row.peer_key,
            });
        }
        Ok(out)
    }

    async fn rekey_queued(&self, old_key: &str, new_key: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE OR REPLACE queued_messages SET peer_key = ? WHERE peer_key = ?")
            .bind(new_key)
            .bind(old_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
