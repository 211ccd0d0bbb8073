//! # High-Level Node API
//!
//! A [`Node`] wires identity, directory, secure channel, overlay, router and
//! discovery into one handle with an explicit lifecycle.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = NodeConfig::from_sources(sources)?;
//! let node = Node::quic(config);
//!
//! let mut messages = node.messages();
//! node.start().await?;
//! node.subscribe("news").await?;
//! node.publish("news", b"hello".to_vec()).await?;
//!
//! while let Some(msg) = messages.recv().await {
//!     println!("{}: {}", msg.topic, String::from_utf8_lossy(&msg.payload));
//! }
//! node.stop().await?;
//! ```
//!
//! ## Startup
//!
//! 1. Seed the directory with configured tier-1 and tier-2 peers
//! 2. Listen on the secure channel (fatal on failure)
//! 3. Spawn the overlay and subscribe to configured topics and the node's DID
//! 4. Link configured peers, waiting at most `startup_link_timeout`
//!    (failures only degrade the start)
//! 5. Start the discovery task, if a discovery source was given

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::SecureChannel;
use crate::config::{NodeConfig, StaticPeer};
use crate::directory::{PeerDirectory, PeerRecord, Tier};
use crate::discovery::{spawn_discovery, Discovery};
use crate::identity::Identity;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::overlay::{
    delivery_queue, GossipOverlay, OverlayError, PublishReceipt, ReceivedMessage, Subscription,
};
use crate::quic::QuicChannel;

struct Running {
    overlay: GossipOverlay,
    discovery: Option<JoinHandle<()>>,
}

pub struct Node {
    config: NodeConfig,
    channel: Arc<dyn SecureChannel>,
    directory: PeerDirectory,
    discovery: Option<Arc<dyn Discovery>>,
    lifecycle: Lifecycle,
    delivery_tx: broadcast::Sender<ReceivedMessage>,
    running: Mutex<Option<Running>>,
}

impl Node {
    pub fn new(config: NodeConfig, channel: Arc<dyn SecureChannel>) -> Self {
        let delivery_tx = delivery_queue(&config.overlay);
        Self {
            config,
            channel,
            directory: PeerDirectory::new(),
            discovery: None,
            lifecycle: Lifecycle::new(),
            delivery_tx,
            running: Mutex::new(None),
        }
    }

    /// A node on a QUIC channel bound to `config.listen`.
    pub fn quic(config: NodeConfig) -> Self {
        let channel = QuicChannel::new(config.keypair.clone(), config.listen);
        Self::new(config, Arc::new(channel))
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn identity(&self) -> Identity {
        self.config.identity()
    }

    pub fn did(&self) -> String {
        self.identity().to_did()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.watch()
    }

    /// Address peers should dial, once started.
    pub fn local_addr(&self) -> Option<String> {
        self.channel.local_addr()
    }

    /// Delivered messages. Subscriptions taken before [`start`](Self::start) see everything.
    pub fn messages(&self) -> Subscription {
        Subscription::new(&self.delivery_tx)
    }

    pub async fn start(&self) -> Result<()> {
        self.lifecycle.transition(LifecycleState::Starting)?;
        match self.launch().await {
            Ok(running) => {
                *self.running.lock().await = Some(running);
                self.lifecycle.transition(LifecycleState::Running)?;
                let addr = self.local_addr().unwrap_or_default();
                info!(did = %self.did(), addr = %addr, "node running");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "node failed to start");
                self.lifecycle.transition(LifecycleState::Stopped)?;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        self.seed_directory().await;

        let inbound = self
            .channel
            .listen()
            .await
            .context("failed to start listening on the secure channel")?;

        let overlay = GossipOverlay::spawn_with_delivery(
            self.config.keypair.clone(),
            self.channel.clone(),
            inbound,
            self.directory.clone(),
            self.config.overlay.clone(),
            self.delivery_tx.clone(),
        );

        let mut topics = self.config.topics.clone();
        if self.config.subscribe_own_did {
            topics.push(self.did());
        }
        for topic in &topics {
            if let Err(e) = overlay.subscribe(topic).await {
                overlay.quit(Duration::ZERO).await;
                return Err(e).with_context(|| format!("failed to subscribe to `{topic}`"));
            }
        }

        self.link_configured_peers(&overlay).await;

        let discovery = self.discovery.clone().map(|discovery| {
            spawn_discovery(
                discovery,
                self.directory.clone(),
                overlay.clone(),
                self.config.overlay.mesh_n_high,
                self.config.rediscover_interval,
            )
        });

        Ok(Running { overlay, discovery })
    }

    async fn seed_directory(&self) {
        let configured = self
            .config
            .tier1
            .iter()
            .map(|p| (p, Tier::Tier1))
            .chain(self.config.tier2.iter().map(|p| (p, Tier::Tier2)));
        for (peer, tier) in configured {
            self.directory
                .upsert(PeerRecord::configured(peer.identity, tier, peer.addr.clone()))
                .await;
        }
    }

    /// Dials every configured peer in parallel. Failures are logged, not returned.
    async fn link_configured_peers(&self, overlay: &GossipOverlay) {
        let peers: Vec<&StaticPeer> = self.config.tier1.iter().chain(&self.config.tier2).collect();
        if peers.is_empty() {
            return;
        }

        let wait = self.config.startup_link_timeout;
        let attempts = peers.iter().map(|peer| async move {
            let result = tokio::time::timeout(wait, overlay.connect(peer.identity, &peer.addr, true)).await;
            (*peer, result)
        });

        let mut linked = 0usize;
        for (peer, result) in join_all(attempts).await {
            match result {
                Ok(Ok(())) => linked += 1,
                Ok(Err(e)) => warn!(
                    peer = %peer.identity.short(),
                    addr = %peer.addr,
                    error = %e,
                    "LinkError: configured peer unreachable, continuing degraded"
                ),
                Err(_) => warn!(
                    peer = %peer.identity.short(),
                    addr = %peer.addr,
                    wait_ms = wait.as_millis() as u64,
                    "LinkError: configured peer did not link in time, continuing degraded"
                ),
            }
        }
        info!(linked, configured = peers.len(), "configured peers linked");
    }

    /// Closes all links within the grace period and stops listening.
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.transition(LifecycleState::Stopping)?;
        let running = self.running.lock().await.take();
        if let Some(Running { overlay, discovery }) = running {
            if let Some(task) = discovery {
                task.abort();
            }
            overlay.quit(self.config.grace_period).await;
        }
        self.lifecycle.transition(LifecycleState::Stopped)?;
        Ok(())
    }

    async fn overlay(&self) -> Result<GossipOverlay, OverlayError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.overlay.clone())
            .ok_or(OverlayError::Closed)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), OverlayError> {
        self.overlay().await?.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), OverlayError> {
        self.overlay().await?.unsubscribe(topic).await
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishReceipt, OverlayError> {
        self.overlay().await?.publish(topic, payload).await
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        match self.overlay().await {
            Ok(overlay) => overlay.subscriptions().await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        match self.overlay().await {
            Ok(overlay) => overlay.mesh_peers(topic).await,
            Err(_) => Vec::new(),
        }
    }

    pub async fn linked_peers(&self) -> Vec<Identity> {
        match self.overlay().await {
            Ok(overlay) => overlay.linked_peers().await,
            Err(_) => Vec::new(),
        }
    }

    /// Hints the overlay at a peer to link to. The peer stays untrusted.
    pub async fn add_peer(&self, identity: Identity, addr: &str) -> Result<(), OverlayError> {
        let overlay = self.overlay().await?;
        self.directory.record_discovered(identity, addr.to_string()).await;
        overlay.add_peer(identity, addr).await;
        Ok(())
    }
}
