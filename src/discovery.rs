//! Peer discovery.
//!
//! A [`Discovery`] source yields candidate peers as a stream. The stream may
//! be finite (a fixed list) or never end (a live mechanism); the node's
//! discovery task restarts it after `rediscover_interval` whenever it ends.
//! Discovered peers enter the directory as [`Tier::Unknown`](crate::directory::Tier::Unknown):
//! they can carry traffic but their own messages are never delivered.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::directory::PeerDirectory;
use crate::identity::Identity;
use crate::overlay::GossipOverlay;

pub const DEFAULT_REDISCOVER_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub identity: Identity,
    pub addr: String,
}

pub trait Discovery: Send + Sync + 'static {
    /// Starts a fresh discovery round.
    fn discover(&self) -> BoxStream<'static, DiscoveredPeer>;
}

/// Replays a fixed list every round.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    peers: Vec<DiscoveredPeer>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<DiscoveredPeer>) -> Self {
        Self { peers }
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self) -> BoxStream<'static, DiscoveredPeer> {
        stream::iter(self.peers.clone()).boxed()
    }
}

/// Feeds discovered peers into the directory and asks the overlay to link
/// to new ones while it has fewer than `link_target` links.
pub(crate) fn spawn_discovery(
    discovery: Arc<dyn Discovery>,
    directory: PeerDirectory,
    overlay: GossipOverlay,
    link_target: usize,
    rediscover_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let local = overlay.identity();
        loop {
            let mut peers = discovery.discover();
            let mut found = 0usize;
            while let Some(peer) = peers.next().await {
                if peer.identity == local {
                    continue;
                }
                if !directory.record_discovered(peer.identity, peer.addr.clone()).await {
                    continue;
                }
                found += 1;
                debug!(peer = %peer.identity.short(), addr = %peer.addr, "discovered peer");
                if overlay.linked_peers().await.len() < link_target {
                    overlay.add_peer(peer.identity, &peer.addr).await;
                }
            }
            if found > 0 {
                info!(found, "discovery round complete");
            }
            tokio::time::sleep(rediscover_interval).await;
        }
    })
}
