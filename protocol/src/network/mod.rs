//! # Network Module
//!
//! Everything between the raw transport and the chain: who we talk to, how
//! we talk to them, and how blocks and transactions move across the mesh.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs  Transport trait and the in-process MemoryNetwork
//! link.rs       Per-connection handshake and sealed frames
//! messager.rs   Correlated request/response over a link
//! peer_store.rs Known, connecting and connected peers
//! topology.rs   Dial/drop planning toward a target neighbor count
//! gossip.rs     Signed, hop-limited epidemic broadcast
//! sync.rs       Catch-up, block application and reorgs
//! pool.rs       Pending transactions
//! node.rs       The event loop wiring it all together
//! ```
//!
//! ## Design Decisions
//!
//! - The peer store, topologist, gossip engine and sync engine do no I/O of
//!   their own. They return plans (dial this, relay to those, fetch that)
//!   and the node runtime executes them. This keeps them testable without
//!   sockets or timers.
//! - Sessions are keyed per connection by a fresh X25519 exchange signed
//!   with the long-term Ed25519 identity. Nothing sealed is accepted before
//!   the exchange completes.
//! - Gossip deduplication uses a bounded seen set keyed by a BLAKE3 digest
//!   of topic, originator and payload, and a hop budget bounds relaying
//!   regardless of topology.

pub mod gossip;
pub mod link;
pub mod messager;
pub mod node;
pub mod peer_store;
pub mod pool;
pub mod sync;
pub mod topology;
pub mod transport;

pub use gossip::{Gossip, GossipConfig, GossipEnvelope, GossipError, GossipEvent, GossipOutcome, GossipStats, RelayPlan, Topic};
pub use link::{Inbound, Link, LocalInfo, ProtocolError};
pub use messager::{Envelope, Messager, MessagerConfig, MessagerError, Request, Response};
pub use node::{Node, NodeError, NodeEvent, NodeHandle, NodeQuery, NodeSnapshot, NodeStatus, QueryAnswer};
pub use peer_store::{DialError, DialOutcome, PeerAnnouncement, PeerRecord, PeerStatus, PeerStore};
pub use pool::{PoolConfig, PoolError, TxPool};
pub use sync::{
    BlockSource, BlockState, CandidateOutcome, SyncConfig, SyncEngine, SyncError, SyncRequest, SyncResponse,
    SyncStats, TransactionValidator, ValidationError,
};
pub use topology::{DropReason, TopologyAction, TopologyConfig, Topologist};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, TransportError, TransportEvent};
