//! pak_mesh — Secure multi-hop mesh messaging core
//!
//! # Components
//! - `handshake`   — Handshake Coordinator: per-connection phase machine with timers
//! - `sessions`    — Session Manager: one NoiseLikeSession per peer, promotion, pruning
//! - `relay`       — Relay Engine: duplicate/loop/rate/TTL checks and next-hop choice
//! - `queue`       — Offline Queue & Sync: bounded per-peer queues, retry, digests
//! - `node`        — MeshNode wiring the above to a transport
//! - `maintenance` — periodic retry/eviction loop
//!
//! # Supporting modules
//! - `transport` / `loopback` — link abstraction and an in-process implementation
//! - `link`   — per-connection MTU, fragmentation and reassembly
//! - `events` — event bus and application callbacks
//! - `config` — node configuration
//! - `error`  — mesh error taxonomy

pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod link;
pub mod loopback;
pub mod maintenance;
pub mod node;
pub mod queue;
pub mod relay;
pub mod sessions;
pub mod transport;

pub use config::MeshConfig;
pub use error::MeshError;
pub use events::{spawn_callback_dispatcher, EventBus, MeshCallbacks, MeshEvent};
pub use handshake::{HandshakeCoordinator, HandshakeOutcome, HandshakePhase};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use maintenance::{spawn_maintenance_loop, MaintenanceHandle};
pub use node::{MaintenanceReport, MeshNode};
pub use queue::OfflineQueue;
pub use relay::{DropReason, RelayDecision, RelayEngine, RelayStatsSnapshot};
pub use sessions::SessionManager;
pub use transport::{ConnectionId, Transport, TransportEvent};
