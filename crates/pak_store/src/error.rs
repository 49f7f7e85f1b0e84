use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked; unlock before touching queued payloads")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] pak_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Persistent id {persistent_id} already bound: stored={stored} new={new}")]
    IdentityKeyConflict {
        persistent_id: String,
        stored: String,
        new: String,
    },

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Migration error: {0}")]
    Migration(String),
}
