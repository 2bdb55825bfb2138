//! # Protocol Configuration & Constants
//!
//! Every tunable number in Kestrel lives here. Component configs elsewhere
//! in the crate take their defaults from these constants, and [`NodeConfig`]
//! aggregates them into the one struct a node is built from.
//!
//! Changing a wire-level constant (frame limits, handshake context, hop
//! limit) after peers are deployed means a protocol version bump. Changing a
//! timing constant does not.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::ControlConfig;
use crate::crypto::hash::parse_hex32;
use crate::crypto::keys::PeerId;
use crate::network::gossip::GossipConfig;
use crate::network::messager::MessagerConfig;
use crate::network::pool::PoolConfig;
use crate::network::sync::SyncConfig;
use crate::network::topology::TopologyConfig;
use crate::workers::MinerConfig;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version string, reported on the control channel.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Wire protocol version carried in every peer handshake. Peers with a
/// different wire version are refused.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

/// Domain-separation prefix for handshake signatures.
pub const HANDSHAKE_CONTEXT: &[u8] = b"kestrel-handshake v1";

/// Domain-separation prefix for gossip originator signatures.
pub const GOSSIP_SIGNATURE_CONTEXT: &[u8] = b"kestrel-gossip v1";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// X25519 public key length in bytes.
pub const EXCHANGE_KEY_LENGTH: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// BLAKE3 KDF context for per-connection session keys.
pub const SESSION_KDF_CONTEXT: &str = "kestrel v1 session key";

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Number of direct connections the topologist tries to hold.
pub const TARGET_NEIGHBORS: usize = 5;

/// How long a dial may stay in `connecting` before it counts as failed.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// First retry delay after a failed dial. Doubles per consecutive failure.
pub const DIAL_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the dial retry delay.
pub const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Consecutive dial failures after which a peer is evicted.
pub const MAX_DIAL_FAILURES: u32 = 5;

/// Silence after which a peer is dropped (connected) or forgotten (known).
pub const PEER_TTL: Duration = Duration::from_secs(120);

/// A peer dialed within this window is ranked below untried peers.
pub const RECENT_ATTEMPT_WINDOW: Duration = Duration::from_secs(30);

/// Interval of the node's maintenance tick (topology plan, expiry, pruning).
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// Default unicast request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Maximum size of a single peer frame. Anything bigger is refused before
/// decryption is attempted.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

/// Maximum number of relays for a single gossip envelope.
pub const GOSSIP_MAX_HOPS: u8 = 6;

/// Number of neighbors each node relays a new envelope to.
pub const GOSSIP_FANOUT: usize = 4;

/// Seen-set capacity.
pub const GOSSIP_SEEN_CAPACITY: usize = 100_000;

/// Seen-set entries older than this are evicted.
pub const GOSSIP_SEEN_RETENTION: Duration = Duration::from_secs(600);

/// Seen-set entries younger than this are never evicted by size pressure.
/// Chosen well above `GOSSIP_MAX_HOPS` x a pessimistic per-hop latency.
pub const GOSSIP_PROPAGATION_WINDOW: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Maximum number of ancestors fetched while chasing a fork.
pub const MAX_BACKFILL_DEPTH: u64 = 64;

/// Maximum number of transactions in a single block.
pub const MAX_BLOCK_TRANSACTIONS: usize = 10_000;

/// Blocks timestamped further than this into the future are rejected.
pub const MAX_FUTURE_DRIFT: Duration = Duration::from_secs(120);

/// Largest `GetBlocks` range served in one response.
pub const SYNC_BATCH_SIZE: u64 = 128;

/// Out-of-order blocks held while the gap below them is filled.
pub const MAX_BUFFERED_BLOCKS: usize = 256;

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Grace period between a terminate request and a forced abort.
pub const WORKER_TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Bounded depth of worker request queues.
pub const WORKER_QUEUE_DEPTH: usize = 64;

/// Number of transaction validation workers.
pub const VALIDATION_WORKERS: usize = 4;

/// Nonces tried between checks of the miner's request queue.
pub const MINING_SLICE: u64 = 4_096;

/// Leading zero bits required of a locally mined block hash.
pub const DEFAULT_DIFFICULTY: u32 = 16;

// ---------------------------------------------------------------------------
// Transaction Pool
// ---------------------------------------------------------------------------

/// Maximum pending transactions held by a node.
pub const POOL_MAX_SIZE: usize = 10_000;

/// Maximum pending transactions per sender address.
pub const POOL_MAX_PER_SENDER: usize = 100;

/// Transactions pulled from the pool into one candidate.
pub const MAX_CANDIDATE_TRANSACTIONS: usize = 1_000;

// ---------------------------------------------------------------------------
// Control Channel
// ---------------------------------------------------------------------------

/// Maximum control frame size.
pub const CONTROL_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Consecutive undecryptable or unparsable frames before the control channel
/// resets itself.
pub const CONTROL_MAX_BAD_FRAMES: u32 = 3;

/// How long a connected control client has to send its key frame.
pub const CONTROL_KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Default P2P listening port.
pub const DEFAULT_P2P_PORT: u16 = 7340;

/// Default control channel port (loopback only).
pub const DEFAULT_CONTROL_PORT: u16 = 7341;

/// Default metrics / status HTTP port.
pub const DEFAULT_METRICS_PORT: u16 = 7342;

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Aggregated configuration for a node instance.
///
/// Every section falls back to its `Default` when omitted, so a config file
/// only needs the keys it actually overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Whether this node is reachable without a relay.
    pub is_public: bool,
    /// Transport address advertised to peers, if any.
    pub listen_address: Option<String>,
    pub topology: TopologyConfig,
    pub gossip: GossipConfig,
    pub messager: MessagerConfig,
    pub sync: SyncConfig,
    pub control: ControlConfig,
    pub pool: PoolConfig,
    pub mining: MinerConfig,
    /// Transaction validation workers. Zero validates on the event loop.
    pub validation_workers: usize,
    /// Peers to learn about at startup.
    pub bootstrap: Vec<BootstrapPeer>,
    /// Period of the topology and housekeeping tick.
    pub maintenance_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            is_public: false,
            listen_address: None,
            topology: TopologyConfig::default(),
            gossip: GossipConfig::default(),
            messager: MessagerConfig::default(),
            sync: SyncConfig::default(),
            control: ControlConfig::default(),
            pool: PoolConfig::default(),
            mining: MinerConfig::default(),
            validation_workers: VALIDATION_WORKERS,
            bootstrap: Vec::new(),
            maintenance_interval_ms: MAINTENANCE_INTERVAL.as_millis() as u64,
        }
    }
}

/// A peer given on the command line or in the config file, written
/// `<peer id>` or `<peer id>@<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub peer_id: PeerId,
    pub address: Option<String>,
}

impl std::str::FromStr for BootstrapPeer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, address) = match s.split_once('@') {
            Some((id, address)) if !address.is_empty() => (id, Some(address.to_string())),
            Some((id, _)) => (id, None),
            None => (s, None),
        };
        let peer_id = id
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bootstrap peer {s:?}: {e}")))?;
        Ok(Self { peer_id, address })
    }
}

impl NodeConfig {
    /// Loads a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parses a config from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topology.target_neighbors == 0 {
            return Err(ConfigError::Invalid(
                "topology.target_neighbors must be at least 1".into(),
            ));
        }
        if self.gossip.max_hops == 0 {
            return Err(ConfigError::Invalid("gossip.max_hops must be at least 1".into()));
        }
        if self.gossip.fanout == 0 {
            return Err(ConfigError::Invalid("gossip.fanout must be at least 1".into()));
        }
        if self.messager.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "messager.request_timeout_ms must be positive".into(),
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::Invalid("maintenance_interval_ms must be positive".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("sync.batch_size must be at least 1".into()));
        }
        if self.mining.difficulty > 256 {
            return Err(ConfigError::Invalid("mining.difficulty cannot exceed 256 bits".into()));
        }
        if let Some(address) = &self.mining.reward_address {
            if parse_hex32(address).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "mining.reward_address {address:?} is not a 32-byte hex address"
                )));
            }
        }
        if self.control.max_frame_size == 0 {
            return Err(ConfigError::Invalid("control.max_frame_size must be positive".into()));
        }
        Ok(())
    }
}

/// Errors while loading a [`NodeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_constants_sanity() {
        assert!(DIAL_BACKOFF_BASE < DIAL_BACKOFF_MAX);
        assert!(GOSSIP_PROPAGATION_WINDOW < GOSSIP_SEEN_RETENTION);
        assert!(REQUEST_TIMEOUT < PEER_TTL);
    }

    #[test]
    fn test_crypto_parameter_sizes() {
        assert_eq!(AES_KEY_LENGTH, 32);
        assert_eq!(AES_NONCE_LENGTH, 12);
        assert_eq!(EXCHANGE_KEY_LENGTH, 32);
        assert_eq!(SIGNATURE_LENGTH, 64);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config = NodeConfig::from_json("{}").unwrap();
        assert_eq!(config.topology.target_neighbors, TARGET_NEIGHBORS);
        assert_eq!(config.gossip.max_hops, GOSSIP_MAX_HOPS);
        assert_eq!(config.messager.request_timeout_ms, 3_000);
        assert!(!config.is_public);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config =
            NodeConfig::from_json(r#"{ "is_public": true, "topology": { "target_neighbors": 8 } }"#)
                .unwrap();
        assert!(config.is_public);
        assert_eq!(config.topology.target_neighbors, 8);
        assert_eq!(config.topology.max_dial_failures, MAX_DIAL_FAILURES);
    }

    #[test]
    fn zero_hops_is_rejected() {
        let err = NodeConfig::from_json(r#"{ "gossip": { "max_hops": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = NodeConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn bootstrap_peer_parses_with_and_without_address() {
        let id = crate::crypto::keys::NodeKeypair::from_seed(&[3; 32]).peer_id();
        let bare: BootstrapPeer = id.as_str().parse().unwrap();
        assert_eq!(bare.peer_id, id);
        assert_eq!(bare.address, None);

        let full: BootstrapPeer = format!("{id}@10.0.0.7:7340").parse().unwrap();
        assert_eq!(full.address.as_deref(), Some("10.0.0.7:7340"));
        assert!("not-a-peer@1.2.3.4:1".parse::<BootstrapPeer>().is_err());
    }

    #[test]
    fn malformed_reward_address_is_rejected() {
        let err = NodeConfig::from_json(r#"{ "mining": { "reward_address": "beef" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let config = NodeConfig::from_json("{}").unwrap();
        assert_eq!(config.validation_workers, VALIDATION_WORKERS);
        assert!(!config.mining.enabled);
    }
}
