//! # Wire Protocol Messages
//!
//! Every byte string exchanged over a link is one bincode-encoded [`Frame`].
//! Decoding always goes through [`decode_frame`], which enforces
//! [`MAX_FRAME_SIZE`] so a hostile peer cannot make us allocate unbounded
//! buffers.
//!
//! ## Frames
//!
//! | Frame | Purpose |
//! |-------|---------|
//! | `Hello` | First frame on a link: advertised listen address and subscriptions |
//! | `Subscribe` / `Unsubscribe` | Topic interest announcements |
//! | `Graft` / `Prune` | Mesh membership changes; `Prune` carries peer exchange hints |
//! | `Publish` | A signed [`GossipMessage`] |
//! | `IHave` / `IWant` | Lazy repair of missed messages |
//! | `MeshGossip` | Mesh membership gossip for a topic |
//! | `Ping` / `Pong` | Liveness probe |
//!
//! ## Message IDs
//!
//! `blake3(sender || topic || sequence)`, used to key the repair cache.
//! Deduplication itself uses the (sender, topic, sequence) triple.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::{sign_with_domain, SignatureError, MESSAGE_SIGNATURE_DOMAIN};
use crate::identity::{Identity, Keypair};

/// Maximum encoded size of a single frame.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Maximum peer hints carried by one `Prune` or `MeshGossip` frame.
pub const MAX_PEER_HINTS: usize = 16;

pub type MessageId = [u8; 32];

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

/// Deserialize with the frame size bound enforced.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// A peer identity together with an address it can be dialed on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHint {
    pub identity: Identity,
    pub addr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub topic: String,
    pub sender: Identity,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl GossipMessage {
    /// Builds and signs a message from the local node.
    pub fn signed(keypair: &Keypair, topic: &str, sequence: u64, payload: Vec<u8>) -> Self {
        let sender = keypair.identity();
        let signed = signed_payload(&sender, topic, sequence, &payload);
        let signature = sign_with_domain(keypair, MESSAGE_SIGNATURE_DOMAIN, &signed);
        Self {
            topic: topic.to_string(),
            sender,
            sequence,
            payload,
            signature,
        }
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let signed = signed_payload(&self.sender, &self.topic, self.sequence, &self.payload);
        self.sender
            .verify(MESSAGE_SIGNATURE_DOMAIN, &signed, &self.signature)
    }

    pub fn id(&self) -> MessageId {
        message_id(&self.sender, &self.topic, self.sequence)
    }
}

pub fn message_id(sender: &Identity, topic: &str, sequence: u64) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(sender.as_bytes());
    hasher.update(&(topic.len() as u32).to_be_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(&sequence.to_be_bytes());
    *hasher.finalize().as_bytes()
}

/// Length-prefixed fields so no two distinct messages share signed bytes.
fn signed_payload(sender: &Identity, topic: &str, sequence: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 4 + topic.len() + 8 + 4 + payload.len());
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(&(topic.len() as u32).to_be_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        listen_addr: Option<String>,
        topics: Vec<String>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Graft {
        topic: String,
    },
    Prune {
        topic: String,
        peers: Vec<PeerHint>,
        backoff_secs: u64,
    },
    Publish(GossipMessage),
    IHave {
        topic: String,
        ids: Vec<MessageId>,
    },
    IWant {
        ids: Vec<MessageId>,
    },
    MeshGossip {
        topic: String,
        peers: Vec<PeerHint>,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
}

impl Frame {
    /// Short name for trace logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Graft { .. } => "graft",
            Frame::Prune { .. } => "prune",
            Frame::Publish(_) => "publish",
            Frame::IHave { .. } => "ihave",
            Frame::IWant { .. } => "iwant",
            Frame::MeshGossip { .. } => "mesh_gossip",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }
}
