//! pak_proto — Wire types and framing for the PakConnect mesh
//!
//! # Modules
//! - `frame`    — type-tagged, length-prefixed link frames
//! - `message`  — payloads carried in frames (identity, status, acks, sync)
//! - `envelope` — multi-hop relay envelope with deterministic id
//! - `fragment` — MTU fragmentation and reassembly
//! - `error`    — protocol error type

pub mod envelope;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod message;

pub use envelope::RelayEnvelope;
pub use error::ProtoError;
pub use fragment::{Fragment, Reassembler};
pub use frame::{Frame, FrameKind};
pub use message::{
    AckPayload, DirectMessage, IdentityPayload, QueueDigest, QueueSyncRequest, StatusSyncPayload,
};
