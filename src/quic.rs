//! QUIC secure channel.
//!
//! Each link is one QUIC connection carrying one bidirectional stream.
//! Mutual TLS with self-signed Ed25519 certificates (see [`crate::crypto`])
//! authenticates both ends: the dialer pins the expected identity through
//! SNI, the listener learns the dialer's identity from its client
//! certificate.
//!
//! Frames on the stream are `u32` big-endian length followed by the payload,
//! capped at [`MAX_FRAME_SIZE`].
//!
//! The dialer's stream only becomes visible to the listener once it carries
//! data, so the first frame must be written before the listener can accept.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Inbound, Link, LinkError, LinkReader, LinkWriter, SecureChannel, INBOUND_QUEUE};
use crate::crypto::{
    create_client_config, create_server_config, extract_verified_identity, generate_ed25519_cert,
    identity_to_sni,
};
use crate::identity::{Identity, Keypair};
use crate::messages::MAX_FRAME_SIZE;

/// Bound on the inbound side of a handshake, including the first stream.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close` waits for the peer to read what was written.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

struct Listening {
    endpoint: Endpoint,
    accept_task: JoinHandle<()>,
}

pub struct QuicChannel {
    keypair: Keypair,
    bind_addr: SocketAddr,
    advertised: Option<String>,
    state: Mutex<Option<Listening>>,
}

impl QuicChannel {
    pub fn new(keypair: Keypair, bind_addr: SocketAddr) -> Self {
        Self {
            keypair,
            bind_addr,
            advertised: None,
            state: Mutex::new(None),
        }
    }

    /// Address to announce to peers instead of the bound socket address.
    pub fn with_advertised_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertised = Some(addr.into());
        self
    }

    fn endpoint(&self) -> Result<Endpoint, LinkError> {
        let state = self.state.lock().map_err(|_| LinkError::NotListening)?;
        state
            .as_ref()
            .map(|l| l.endpoint.clone())
            .ok_or(LinkError::NotListening)
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().ok()?;
        state.as_ref().and_then(|l| l.endpoint.local_addr().ok())
    }
}

fn handshake_error(e: impl std::fmt::Display) -> LinkError {
    LinkError::Handshake(e.to_string())
}

#[async_trait]
impl SecureChannel for QuicChannel {
    async fn listen(&self) -> Result<Inbound, LinkError> {
        let (server_certs, server_key) =
            generate_ed25519_cert(&self.keypair).map_err(handshake_error)?;
        let (client_certs, client_key) =
            generate_ed25519_cert(&self.keypair).map_err(handshake_error)?;
        let server_config = create_server_config(server_certs, server_key).map_err(handshake_error)?;
        let client_config = create_client_config(client_certs, client_key).map_err(handshake_error)?;

        let mut endpoint = Endpoint::server(server_config, self.bind_addr)
            .map_err(|e| LinkError::Io(format!("failed to bind {}: {e}", self.bind_addr)))?;
        endpoint.set_default_client_config(client_config);

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let accept_endpoint = endpoint.clone();
        let accept_task = tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(ACCEPT_TIMEOUT, accept_link(incoming)).await {
                        Ok(Ok(link)) => {
                            let _ = tx.send(link).await;
                        }
                        Ok(Err(e)) => debug!(error = %e, "inbound handshake failed"),
                        Err(_) => debug!("inbound handshake timed out"),
                    }
                });
            }
        });

        let mut state = self.state.lock().map_err(|_| LinkError::NotListening)?;
        if let Some(previous) = state.replace(Listening { endpoint, accept_task }) {
            previous.accept_task.abort();
            previous.endpoint.close(0u32.into(), b"rebound");
        }
        Ok(rx)
    }

    async fn connect(&self, addr: &str, expected: &Identity) -> Result<Link, LinkError> {
        let endpoint = self.endpoint()?;
        let socket_addr = tokio::net::lookup_host(addr)
            .await
            .map_err(|_| LinkError::InvalidAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| LinkError::InvalidAddress(addr.to_string()))?;

        let connection = endpoint
            .connect(socket_addr, &identity_to_sni(expected))
            .map_err(handshake_error)?
            .await
            .map_err(|e| match e {
                quinn::ConnectionError::TimedOut => LinkError::Timeout,
                other => handshake_error(other),
            })?;

        let actual = extract_verified_identity(&connection)
            .ok_or_else(|| LinkError::Handshake("peer presented no usable certificate".into()))?;
        if actual != *expected {
            connection.close(0u32.into(), b"identity mismatch");
            return Err(LinkError::IdentityMismatch {
                addr: addr.to_string(),
                expected: *expected,
                actual,
            });
        }

        let (send, recv) = connection.open_bi().await.map_err(handshake_error)?;
        Ok(quic_link(actual, connection, send, recv))
    }

    fn local_addr(&self) -> Option<String> {
        self.advertised
            .clone()
            .or_else(|| self.bound_addr().map(|a| a.to_string()))
    }

    async fn shutdown(&self, linger: Duration) {
        let previous = match self.state.lock() {
            Ok(mut state) => state.take(),
            Err(_) => None,
        };
        if let Some(listening) = previous {
            listening.accept_task.abort();
            listening.endpoint.close(0u32.into(), b"shutdown");
            if tokio::time::timeout(linger.min(CLOSE_LINGER), listening.endpoint.wait_idle())
                .await
                .is_err()
            {
                warn!("QUIC endpoint did not go idle before shutdown deadline");
            }
        }
    }
}

async fn accept_link(incoming: quinn::Incoming) -> Result<Link, LinkError> {
    let connection = incoming.await.map_err(handshake_error)?;
    let remote = extract_verified_identity(&connection)
        .ok_or_else(|| LinkError::Handshake("peer presented no usable certificate".into()))?;
    let (send, recv) = connection.accept_bi().await.map_err(handshake_error)?;
    debug!(peer = %remote.short(), addr = %connection.remote_address(), "accepted QUIC link");
    Ok(quic_link(remote, connection, send, recv))
}

fn quic_link(remote: Identity, connection: Connection, send: SendStream, recv: RecvStream) -> Link {
    Link {
        remote,
        remote_addr: connection.remote_address().to_string(),
        writer: Box::new(QuicWriter {
            send,
            connection: connection.clone(),
            closed: false,
        }),
        reader: Box::new(QuicReader { recv }),
    }
}

struct QuicWriter {
    send: SendStream,
    connection: Connection,
    closed: bool,
}

struct QuicReader {
    recv: RecvStream,
}

#[async_trait]
impl LinkWriter for QuicWriter {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        let len = frame.len() as u32;
        self.send
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        self.send
            .write_all(&frame)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.send.finish().is_ok() {
            let _ = tokio::time::timeout(CLOSE_LINGER, self.send.stopped()).await;
        }
        self.connection.close(0u32.into(), b"closed");
    }
}

#[async_trait]
impl LinkReader for QuicReader {
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        let mut len_buf = [0u8; 4];
        match self.recv.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
            Err(quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(
                quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed,
            ))) => return Ok(None),
            Err(e) => return Err(LinkError::Io(e.to_string())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge(len));
        }

        let mut frame = vec![0u8; len];
        self.recv
            .read_exact(&mut frame)
            .await
            .map_err(|e| LinkError::Io(e.to_string()))?;
        Ok(Some(frame))
    }
}
