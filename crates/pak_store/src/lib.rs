//! pak_store — Local persistence for the PakConnect mesh
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt.  Queued payloads are stored as
//! XChaCha20-Poly1305 ciphertext, base64-encoded, under the vault key.
//! Routing metadata (peer keys, priorities, times) stays in plaintext so
//! the queue can be ordered and evicted with ordinary SQL.
//!
//! # Traits
//! `IdentityStore`, `QueueStore` and `SeenStore` are implemented by both the
//! SQLite-backed [`Store`] and the in-memory [`MemoryStore`].
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on open.

pub mod db;
pub mod error;
pub mod identity;
pub mod memory;
pub mod models;
pub mod queue;
pub mod seen;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use identity::IdentityStore;
pub use memory::MemoryStore;
pub use models::{PeerIdentity, Priority, QueueStatus, QueuedMessage, SeenMessageRecord};
pub use queue::QueueStore;
pub use seen::SeenStore;
pub use vault::Vault;

/// Everything the mesh node persists.
pub trait MeshStore: IdentityStore + QueueStore + SeenStore {}

impl<T: IdentityStore + QueueStore + SeenStore> MeshStore for T {}
