//! # tiermesh - Tiered Gossip Pub/Sub Overlay
//!
//! tiermesh links nodes over authenticated, encrypted channels and spreads
//! signed messages through a bounded per-topic mesh. Only messages from
//! trusted peers reach the application:
//!
//! - **Identity**: Ed25519 keypairs, addressed as `did:tiermesh:<hex key>`
//! - **Tiers**: statically configured tier-1 and tier-2 peers are trusted;
//!   everyone else (discovered or inbound) relays traffic but is never delivered
//! - **Overlay**: GossipSub-style mesh with graft/prune, IHAVE/IWANT gossip,
//!   liveness probes and reconnect backoff
//! - **Transport**: QUIC with mutual Ed25519 TLS, or in-memory links for tests
//!
//! ## Architecture
//!
//! The overlay follows the **Actor Pattern**: a cheap-to-clone handle sends
//! commands to a single task that owns all mutable state. Per-link reader and
//! writer tasks feed it events, and a heartbeat in its `select!` loop drives
//! mesh maintenance.
//!
//! ## Security Model
//!
//! - Every link is mutually authenticated; the dialer pins the identity it expects
//! - Every message is signed with a domain-separated Ed25519 signature
//! - Admission is decided by the sender's configured tier, never by who relayed it
//! - Queues, caches, dedup windows and the peer directory are all bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API and lifecycle wiring |
//! | `config` | Validated node configuration |
//! | `identity` | Keypairs and DID identities |
//! | `crypto` | Domain-separated signatures and TLS certificate binding |
//! | `directory` | Known peers with tier, addresses and reachability |
//! | `channel` | Secure channel contract and in-memory implementation |
//! | `quic` | QUIC secure channel |
//! | `messages` | Wire frames and bounded codec |
//! | `overlay` | Mesh maintenance and propagation |
//! | `router` | Tier-based admission |
//! | `discovery` | Pluggable peer discovery |
//! | `lifecycle` | Node state machine and shutdown signals |

pub mod channel;
pub mod config;
mod crypto;
pub mod directory;
pub mod discovery;
pub mod identity;
pub mod lifecycle;
pub mod messages;
mod node;
pub mod overlay;
pub mod quic;
pub mod router;

pub use channel::{Link, LinkError, MemoryChannel, MemoryNetwork, SecureChannel};
pub use config::{ConfigError, ConfigSources, NodeConfig, StaticPeer};
pub use crypto::SignatureError;
pub use directory::{PeerDirectory, PeerRecord, Tier};
pub use discovery::{DiscoveredPeer, Discovery, StaticDiscovery};
pub use identity::{Identity, InvalidKeyError, Keypair};
pub use lifecycle::{LifecycleError, LifecycleState};
pub use node::Node;
pub use overlay::{
    GossipOverlay, OverlayConfig, OverlayError, PublishReceipt, ReceivedMessage, Subscription,
};
pub use router::{Admission, MessageRouter, RejectReason};
