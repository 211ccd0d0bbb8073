//! Secure channel contract.
//!
//! The overlay treats links as opaque, authenticated, ordered byte-frame
//! pipes. Anything implementing [`SecureChannel`] can carry it:
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`crate::quic::QuicChannel`] | QUIC with mutual Ed25519 TLS |
//! | [`MemoryChannel`] | in-process links for tests and simulations |
//!
//! A [`Link`] is split into a [`LinkWriter`] and a [`LinkReader`] so one task
//! can write while another reads. Every link carries the identity the
//! channel authenticated for the remote end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::Identity;

/// Inbound links accepted by a listening channel.
pub type Inbound = mpsc::Receiver<Link>;

/// Queue depth for accepted-but-unclaimed inbound links.
pub const INBOUND_QUEUE: usize = 64;

/// Link-level failures. Recoverable: callers retry with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("address `{0}` is invalid")]
    InvalidAddress(String),
    #[error("no listener at `{0}`")]
    Unreachable(String),
    #[error("peer at `{addr}` is {actual:?}, expected {expected:?}")]
    IdentityMismatch {
        addr: String,
        expected: Identity,
        actual: Identity,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connect timed out")]
    Timeout,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("link closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("channel is not listening")]
    NotListening,
}

#[async_trait]
pub trait LinkWriter: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError>;

    /// Flushes and closes the write half. Idempotent.
    async fn close(&mut self);
}

#[async_trait]
pub trait LinkReader: Send {
    /// Next frame, or `None` once the remote end closed cleanly.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, LinkError>;
}

/// An authenticated point-to-point link.
pub struct Link {
    pub remote: Identity,
    /// Transport address of the remote end as observed by the channel.
    pub remote_addr: String,
    pub writer: Box<dyn LinkWriter>,
    pub reader: Box<dyn LinkReader>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("remote", &self.remote)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SecureChannel: Send + Sync + 'static {
    /// Starts accepting links. Calling it again after [`shutdown`](Self::shutdown) restarts.
    async fn listen(&self) -> Result<Inbound, LinkError>;

    /// Opens a link to `addr`, failing unless the remote proves it is `expected`.
    async fn connect(&self, addr: &str, expected: &Identity) -> Result<Link, LinkError>;

    /// Address peers should dial, once listening.
    fn local_addr(&self) -> Option<String>;

    /// Stops accepting links and closes the listener, waiting at most
    /// `linger` for the peers to acknowledge.
    async fn shutdown(&self, linger: Duration);
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Capacity of each direction of an in-memory link.
const MEMORY_LINK_CAPACITY: usize = 256;

struct Listener {
    identity: Identity,
    inbound: mpsc::Sender<Link>,
}

/// A process-local "network" that [`MemoryChannel`]s listen on and dial through.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, Listener>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel for `identity` that will listen on `addr`.
    pub fn channel(&self, identity: Identity, addr: impl Into<String>) -> MemoryChannel {
        MemoryChannel {
            network: self.clone(),
            identity,
            addr: addr.into(),
        }
    }

    fn register(&self, addr: &str, identity: Identity, inbound: mpsc::Sender<Link>) -> Result<(), LinkError> {
        let mut listeners = self.listeners.lock().map_err(|_| LinkError::Closed)?;
        if let Some(existing) = listeners.get(addr)
            && !existing.inbound.is_closed()
        {
            return Err(LinkError::Io(format!("address `{addr}` already in use")));
        }
        listeners.insert(addr.to_string(), Listener { identity, inbound });
        Ok(())
    }

    fn deregister(&self, addr: &str) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(addr);
        }
    }

    fn resolve(&self, addr: &str) -> Result<(Identity, mpsc::Sender<Link>), LinkError> {
        let listeners = self.listeners.lock().map_err(|_| LinkError::Closed)?;
        let listener = listeners
            .get(addr)
            .filter(|l| !l.inbound.is_closed())
            .ok_or_else(|| LinkError::Unreachable(addr.to_string()))?;
        Ok((listener.identity, listener.inbound.clone()))
    }
}

pub struct MemoryChannel {
    network: MemoryNetwork,
    identity: Identity,
    addr: String,
}

struct MemoryWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

struct MemoryReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl LinkWriter for MemoryWriter {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
        let tx = self.tx.as_ref().ok_or(LinkError::Closed)?;
        tx.send(frame).await.map_err(|_| LinkError::Closed)
    }

    async fn close(&mut self) {
        self.tx.take();
    }
}

#[async_trait]
impl LinkReader for MemoryReader {
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        Ok(self.rx.recv().await)
    }
}

fn memory_pipe() -> (MemoryWriter, MemoryReader) {
    let (tx, rx) = mpsc::channel(MEMORY_LINK_CAPACITY);
    (MemoryWriter { tx: Some(tx) }, MemoryReader { rx })
}

#[async_trait]
impl SecureChannel for MemoryChannel {
    async fn listen(&self) -> Result<Inbound, LinkError> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.network.register(&self.addr, self.identity, tx)?;
        Ok(rx)
    }

    async fn connect(&self, addr: &str, expected: &Identity) -> Result<Link, LinkError> {
        let (remote, inbound) = self.network.resolve(addr)?;
        if remote != *expected {
            return Err(LinkError::IdentityMismatch {
                addr: addr.to_string(),
                expected: *expected,
                actual: remote,
            });
        }

        let (our_writer, their_reader) = memory_pipe();
        let (their_writer, our_reader) = memory_pipe();

        let accepted = Link {
            remote: self.identity,
            remote_addr: self.addr.clone(),
            writer: Box::new(their_writer),
            reader: Box::new(their_reader),
        };
        inbound
            .send(accepted)
            .await
            .map_err(|_| LinkError::Unreachable(addr.to_string()))?;

        Ok(Link {
            remote,
            remote_addr: addr.to_string(),
            writer: Box::new(our_writer),
            reader: Box::new(our_reader),
        })
    }

    fn local_addr(&self) -> Option<String> {
        Some(self.addr.clone())
    }

    async fn shutdown(&self, _linger: Duration) {
        self.network.deregister(&self.addr);
    }
}
