//! Node configuration.
//!
//! Every section has defaults; a JSON file only needs the fields it changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pak_crypto::session::{RekeyPolicy, SessionConfig};
use pak_proto::fragment::FRAGMENT_HEADER_LEN;

use crate::error::MeshError;

pub const CONFIG_ENV: &str = "PAK_MESH_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub display_name: String,
    /// Reveal our persistent id in status sync after the handshake.
    pub share_persistent_id: bool,
    pub maintenance_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSettings {
    pub phase_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub rekey_after_messages: u64,
    pub rekey_after_secs: u64,
    pub strict_contracts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub default_ttl: u8,
    pub duplicate_window_secs: u64,
    pub rate_limit_messages: u32,
    pub rate_limit_window_secs: u64,
    pub max_relay_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub per_peer_capacity: usize,
    pub favorite_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of the delay added or removed at random, 0.0..=1.0.
    pub backoff_jitter: f64,
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub reassembly_timeout_ms: u64,
    pub min_mtu: usize,
    pub max_partial_messages: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeSettings,
    pub handshake: HandshakeSettings,
    pub session: SessionSettings,
    pub relay: RelaySettings,
    pub queue: QueueSettings,
    pub link: LinkSettings,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            display_name: "pak-node".into(),
            share_persistent_id: true,
            maintenance_interval_ms: 1_000,
        }
    }
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self { phase_timeout_ms: 10_000 }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            rekey_after_messages: 10_000,
            rekey_after_secs: 3_600,
            strict_contracts: cfg!(debug_assertions),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_ttl: 3,
            duplicate_window_secs: 300,
            rate_limit_messages: 60,
            rate_limit_window_secs: 60,
            max_relay_queue: 1_000,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            per_peer_capacity: 100,
            favorite_capacity: 500,
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 300_000,
            backoff_jitter: 0.2,
            ack_timeout_ms: 15_000,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            reassembly_timeout_ms: 30_000,
            min_mtu: 23,
            max_partial_messages: 64,
        }
    }
}

impl HandshakeSettings {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            rekey: RekeyPolicy {
                max_messages: self.rekey_after_messages,
                max_age: chrono::Duration::seconds(self.rekey_after_secs as i64),
            },
            strict_contracts: self.strict_contracts,
        }
    }
}

impl MeshConfig {
    /// Load from a JSON file; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))?;
        let config: MeshConfig = serde_json::from_str(&raw)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `PAK_MESH_CONFIG`, or use defaults.
    pub fn from_env() -> Result<Self, MeshError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        fn bail(msg: &str) -> Result<(), MeshError> {
            Err(MeshError::Config(msg.to_owned()))
        }
        if self.handshake.phase_timeout_ms == 0 {
            return bail("handshake.phase_timeout_ms must be positive");
        }
        if self.session.rekey_after_messages == 0 || self.session.rekey_after_secs == 0 {
            return bail("session rekey thresholds must be positive");
        }
        if self.relay.default_ttl == 0 {
            return bail("relay.default_ttl must be at least 1");
        }
        if self.relay.duplicate_window_secs == 0 || self.relay.rate_limit_window_secs == 0 {
            return bail("relay windows must be positive");
        }
        if self.relay.rate_limit_messages == 0 || self.relay.max_relay_queue == 0 {
            return bail("relay limits must be positive");
        }
        if self.queue.per_peer_capacity == 0 || self.queue.favorite_capacity < self.queue.per_peer_capacity {
            return bail("queue.favorite_capacity must be >= per_peer_capacity > 0");
        }
        if self.queue.max_attempts == 0 {
            return bail("queue.max_attempts must be positive");
        }
        if self.queue.backoff_base_ms == 0 || self.queue.backoff_cap_ms < self.queue.backoff_base_ms {
            return bail("queue backoff must satisfy 0 < base <= cap");
        }
        if !(0.0..=1.0).contains(&self.queue.backoff_jitter) {
            return bail("queue.backoff_jitter must be within 0.0..=1.0");
        }
        if self.queue.ack_timeout_ms == 0 || self.link.reassembly_timeout_ms == 0 {
            return bail("timeouts must be positive");
        }
        if self.link.min_mtu <= FRAGMENT_HEADER_LEN {
            return bail("link.min_mtu must exceed the fragment header size");
        }
        if self.node.maintenance_interval_ms == 0 {
            return bail("node.maintenance_interval_ms must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MeshConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: MeshConfig =
            serde_json::from_str(r#"{"relay":{"default_ttl":5},"node":{"display_name":"n1"}}"#)
                .unwrap();
        assert_eq!(cfg.relay.default_ttl, 5);
        assert_eq!(cfg.relay.rate_limit_messages, 60);
        assert_eq!(cfg.node.display_name, "n1");
        assert_eq!(cfg.queue.per_peer_capacity, 100);
        assert_eq!(cfg.handshake.phase_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_zero_ttl_and_tiny_mtu() {
        let mut cfg = MeshConfig::default();
        cfg.relay.default_ttl = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = MeshConfig::default();
        cfg.link.min_mtu = 8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        std::fs::write(&path, r#"{"queue":{"max_attempts":3}}"#).unwrap();
        let cfg = MeshConfig::load(&path).unwrap();
        assert_eq!(cfg.queue.max_attempts, 3);
        assert!(MeshConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
