//! Peer identity persistence.
//!
//! Records are keyed by the handshake-authenticated static key. A persistent
//! id, once bound to a static key, can never silently move to another key.

use async_trait::async_trait;

use crate::{
    db::Store,
    error::StoreError,
    models::{to_ms, PeerIdentity, PeerIdentityRow},
};

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Insert or refresh a peer record. Absent optional fields keep their
    /// stored values.
    async fn upsert_identity(&self, identity: &PeerIdentity) -> Result<(), StoreError>;

    async fn identity_by_static_key(&self, key: &str) -> Result<Option<PeerIdentity>, StoreError>;

    async fn identity_by_persistent_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError>;

    async fn identity_by_ephemeral_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError>;

    /// Bind `persistent_id` to the record last seen under `ephemeral_id`.
    /// Returns false when no such record exists.
    async fn link_persistent_id(
        &self,
        ephemeral_id: &str,
        persistent_id: &str,
    ) -> Result<bool, StoreError>;
}

/// Refuse to rebind a persistent id to a different static key.
pub(crate) fn check_binding(
    existing: Option<&PeerIdentity>,
    persistent_id: &str,
    static_key: &str,
) -> Result<(), StoreError> {
    match existing {
        Some(stored) if stored.static_public_key != static_key => {
            Err(StoreError::IdentityKeyConflict {
                persistent_id: persistent_id.to_owned(),
                stored: stored.static_public_key.clone(),
                new: static_key.to_owned(),
            })
        }
        _ => Ok(()),
    }
}

const SELECT_IDENTITY: &str = "SELECT static_public_key, persistent_id, ephemeral_id, display_name, \
     first_seen_ms, last_seen_ms FROM peer_identities";

impl Store {
    async fn identity_where(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<PeerIdentity>, StoreError> {
        let sql = format!("{SELECT_IDENTITY} WHERE {column} = ? ORDER BY last_seen_ms DESC LIMIT 1");
        let row: Option<PeerIdentityRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PeerIdentity::from))
    }
}

#[async_trait]
impl IdentityStore for Store {
    async fn upsert_identity(&self, identity: &PeerIdentity) -> Result<(), StoreError> {
        if let Some(pid) = &identity.persistent_id {
            let existing = self.identity_by_persistent_id(pid).await?;
            check_binding(existing.as_ref(), pid, &identity.static_public_key)?;
        }

        sqlx::query(
            "INSERT INTO peer_identities \
                (static_public_key, persistent_id, ephemeral_id, display_name, first_seen_ms, last_seen_ms) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(static_public_key) DO UPDATE SET \
                persistent_id = COALESCE(excluded.persistent_id, peer_identities.persistent_id), \
                ephemeral_id  = COALESCE(excluded.ephemeral_id, peer_identities.ephemeral_id), \
                display_name  = COALESCE(excluded.display_name, peer_identities.display_name), \
                last_seen_ms  = excluded.last_seen_ms",
        )
        .bind(&identity.static_public_key)
        .bind(&identity.persistent_id)
        .bind(&identity.ephemeral_id)
        .bind(&identity.display_name)
        .bind(to_ms(identity.first_seen))
        .bind(to_ms(identity.last_seen))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn identity_by_static_key(&self, key: &str) -> Result<Option<PeerIdentity>, StoreError> {
        self.identity_where("static_public_key", key).await
    }

    async fn identity_by_persistent_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError> {
        self.identity_where("persistent_id", id).await
    }

    async fn identity_by_ephemeral_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError> {
        self.identity_where("ephemeral_id", id).await
    }

    async fn link_persistent_id(
        &self,
        ephemeral_id: &str,
        persistent_id: &str,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.identity_by_ephemeral_id(ephemeral_id).await? else {
            return Ok(false);
        };
        let existing = self.identity_by_persistent_id(persistent_id).await?;
        check_binding(existing.as_ref(), persistent_id, &record.static_public_key)?;

        let result = sqlx::query(
            "UPDATE peer_identities SET persistent_id = ? WHERE static_public_key = ?",
        )
        .bind(persistent_id)
        .bind(&record.static_public_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
