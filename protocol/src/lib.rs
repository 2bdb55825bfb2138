// Copyright (c) 2026 Kestrel Contributors. MIT License.
// See LICENSE for details.

//! # Kestrel Protocol: Node Engine
//!
//! The library behind `kestrel-node`: a peer-to-peer blockchain node that
//! keeps a small, self-healing mesh of authenticated neighbors, floods
//! blocks and transactions over it, and follows the longest valid chain.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 identities, X25519 session keys, AES-256-GCM
//!   sealing and BLAKE3 digests.
//! - **chain**: Blocks, transactions, the UTXO set and the finalized chain.
//! - **storage**: Block persistence behind a trait (sled on disk, or memory).
//! - **network**: Peer store, topology, links, gossip, sync and the node
//!   event loop.
//! - **workers**: Off-loop mining and batch transaction validation.
//! - **control**: The encrypted local control channel.
//! - **config**: Protocol constants and node configuration.
//!
//! ## Design Philosophy
//!
//! 1. State machines decide, the runtime acts. Engines return plans and
//!    never touch a socket.
//! 2. Nothing unauthenticated reaches the chain. Every frame on a link is
//!    sealed and every gossip envelope is signed.
//! 3. CPU-heavy work stays off the event loop.

pub mod chain;
pub mod config;
pub mod control;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod workers;
