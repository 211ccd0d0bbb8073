//! # Gossip Overlay
//!
//! Per-topic mesh maintenance and message propagation over authenticated
//! links.
//!
//! ## Architecture
//!
//! [`GossipOverlay`] is a cheap-to-clone handle; a single actor task owns
//! all overlay state (meshes, links, dedup windows, caches) and processes
//! commands, link events and heartbeats sequentially. Each link gets one
//! reader task and one writer task with a bounded outbound queue, and every
//! dial runs in its own task, so a slow or dead peer only stalls its own
//! tasks.
//!
//! ## Peer Sets
//!
//! | Set | Purpose |
//! |-----|---------|
//! | Mesh | Peers we forward every message for a topic to (bounded) |
//! | Direct | Configured tier-1/tier-2 peers: always reconnected, always forwarded to |
//! | Linked | Every peer with an open link; gossip targets are drawn from here |
//!
//! ## Message Flow
//!
//! 1. **Publish**: signed message flooded to every linked peer subscribed to the topic
//! 2. **Forward**: first sighting of a message is forwarded to mesh and direct peers
//! 3. **IHave / IWant**: peers outside the mesh learn recent ids and pull what they missed
//! 4. **Graft / Prune**: mesh membership changes, with backoff after a prune
//! 5. **MeshGossip**: mesh member addresses shared with non-mesh peers
//!
//! ## Deduplication
//!
//! Per (sender, topic) sliding window of [`SEQNO_WINDOW_SIZE`] sequence
//! numbers. A sequence older than the window is rejected as stale, never
//! treated as new. Windows live in an LRU bounded by
//! [`MAX_TRACKED_SENDERS`]; a window evicted by LRU pressure starts over.
//!
//! ## Delivery
//!
//! Admitted messages go to a `broadcast` channel of
//! `delivery_queue_capacity` entries. A subscriber that falls behind loses
//! the oldest messages; [`Subscription::recv`] logs how many were skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::channel::{Inbound, Link, LinkError, LinkReader, LinkWriter, SecureChannel};
use crate::directory::{PeerDirectory, Tier};
use crate::identity::{Identity, Keypair};
use crate::messages::{
    decode_frame, encode_frame, Frame, GossipMessage, MessageId, PeerHint, MAX_FRAME_SIZE,
    MAX_PEER_HINTS,
};
use crate::router::{Admission, MessageRouter};

// ============================================================================
// Constants
// ============================================================================

/// Target mesh size per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// Below this, the heartbeat grafts and backfills.
pub const DEFAULT_MESH_N_LOW: usize = 4;

/// Above this, the heartbeat prunes back to `mesh_n`.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// Non-mesh peers receiving gossip per topic per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// An unanswered ping older than this evicts the peer.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(500);

pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Failing to reach a peer for this long drops it from the active mesh.
pub const DEFAULT_UNREACHABLE_DEADLINE: Duration = Duration::from_secs(300);

pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;

pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Maximum ids in one IHAVE or IWANT.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 100;

pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Outbound frames queued per link before new frames are dropped.
pub const DEFAULT_LINK_QUEUE_CAPACITY: usize = 256;

/// Messages buffered per subscriber before the oldest are dropped.
pub const DEFAULT_DELIVERY_QUEUE_CAPACITY: usize = 1024;

/// Non-static directory records unreachable this long are removed.
pub const DEFAULT_DIRECTORY_RETENTION: Duration = Duration::from_secs(3600);

/// Backfill stops dialing once this many links are open or pending.
pub const DEFAULT_MAX_LINKS: usize = 32;

/// Sliding dedup window per (sender, topic), in sequence numbers.
pub const SEQNO_WINDOW_SIZE: u64 = 128;

/// Bound on dedup windows kept in memory.
pub const MAX_TRACKED_SENDERS: usize = 10_000;

pub const MAX_TOPIC_LENGTH: usize = 256;

/// Topics remembered per linked peer.
pub const MAX_TOPICS_PER_PEER: usize = 100;

/// Upper bound honoured for a peer-requested prune backoff.
const MAX_PRUNE_BACKOFF_SECS: u64 = 3600;

const MAX_BACKOFF_ENTRIES: usize = 10_000;

/// Peer hints accepted from one link per heartbeat.
const HINTS_PER_HEARTBEAT: usize = MAX_PEER_HINTS;

/// Hinted mesh members remembered per topic as backfill candidates.
const MAX_INTERESTED_PER_TOPIC: usize = 64;

/// Heartbeats a message id stays eligible for IHAVE.
const GOSSIP_HISTORY_HEARTBEATS: u32 = 3;

const DIRECTORY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const COMMAND_QUEUE: usize = 1000;

const EVENT_QUEUE: usize = 1024;

/// Room left in a frame for everything but the payload.
const FRAME_OVERHEAD: usize = 4096;

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LENGTH && !topic.chars().any(char::is_control)
}

#[derive(Clone, Debug)]
pub struct OverlayConfig {
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub gossip_lazy: usize,
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub unreachable_deadline: Duration,
    pub prune_backoff: Duration,
    pub message_cache_size: usize,
    pub message_cache_ttl: Duration,
    pub max_ihave_length: usize,
    pub max_payload_size: usize,
    pub link_queue_capacity: usize,
    pub delivery_queue_capacity: usize,
    pub directory_retention: Duration,
    pub max_links: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            unreachable_deadline: DEFAULT_UNREACHABLE_DEADLINE,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            message_cache_ttl: DEFAULT_MESSAGE_CACHE_TTL,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            link_queue_capacity: DEFAULT_LINK_QUEUE_CAPACITY,
            delivery_queue_capacity: DEFAULT_DELIVERY_QUEUE_CAPACITY,
            directory_retention: DEFAULT_DIRECTORY_RETENTION,
            max_links: DEFAULT_MAX_LINKS,
        }
    }
}

impl OverlayConfig {
    /// Checks the relations between fields that the actor relies on.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.mesh_n == 0 {
            return Err("mesh_n must be positive");
        }
        if !(self.mesh_n_low <= self.mesh_n && self.mesh_n <= self.mesh_n_high) {
            return Err("mesh bounds must satisfy mesh_n_low <= mesh_n <= mesh_n_high");
        }
        if self.heartbeat_interval.is_zero() || self.ping_timeout.is_zero() {
            return Err("heartbeat_interval and ping_timeout must be positive");
        }
        if self.max_links < self.mesh_n {
            return Err("max_links must be at least mesh_n");
        }
        if self.reconnect_base.is_zero() || self.reconnect_base > self.reconnect_max {
            return Err("reconnect_base must be positive and at most reconnect_max");
        }
        if self.message_cache_size == 0
            || self.link_queue_capacity == 0
            || self.delivery_queue_capacity == 0
        {
            return Err("cache and queue capacities must be positive");
        }
        if self.max_payload_size + FRAME_OVERHEAD > MAX_FRAME_SIZE {
            return Err("max_payload_size does not fit in a frame");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error("NotSubscribed: not subscribed to topic `{topic}`")]
    NotSubscribed { topic: String },
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("overlay is not running")]
    Closed,
}

/// A message delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub sender: Identity,
    pub sequence: u64,
    pub payload: Vec<u8>,
    /// Tier the sender was admitted under; `None` for our own publications.
    pub tier: Option<Tier>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub sequence: u64,
    pub message_id: MessageId,
    /// Linked peers the message was queued for.
    pub recipients: usize,
}

/// Stream of delivered messages. Each subscription sees every message
/// delivered after it was created.
pub struct Subscription {
    rx: broadcast::Receiver<ReceivedMessage>,
}

pub(crate) fn delivery_queue(config: &OverlayConfig) -> broadcast::Sender<ReceivedMessage> {
    broadcast::channel(config.delivery_queue_capacity.max(1)).0
}

impl Subscription {
    pub(crate) fn new(queue: &broadcast::Sender<ReceivedMessage>) -> Self {
        Self { rx: queue.subscribe() }
    }

    /// Next message, or `None` once the overlay is gone.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagging; oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// Dedup window
// ============================================================================

/// Anti-replay window over the last [`SEQNO_WINDOW_SIZE`] sequence numbers.
#[derive(Clone, Debug, Default)]
struct SeqnoTracker {
    highest: Option<u64>,
    /// Bit `i` set means `highest - i` was seen.
    seen: u128,
}

impl SeqnoTracker {
    /// Records `seqno`, returning `false` for duplicates and stale sequences.
    fn check_and_record(&mut self, seqno: u64) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(seqno);
            self.seen = 1;
            return true;
        };

        if seqno > highest {
            let shift = seqno - highest;
            self.seen = if shift >= SEQNO_WINDOW_SIZE { 0 } else { self.seen << shift };
            self.seen |= 1;
            self.highest = Some(seqno);
            return true;
        }

        let offset = highest - seqno;
        if offset >= SEQNO_WINDOW_SIZE {
            return false;
        }
        let bit = 1u128 << offset;
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }
}

// ============================================================================
// Mesh view and per-peer bookkeeping
// ============================================================================

/// Peers chosen for eager propagation on one topic.
#[derive(Clone, Debug, Default)]
pub struct MeshView {
    peers: HashSet<Identity>,
}

impl MeshView {
    fn insert(&mut self, peer: Identity) -> bool {
        self.peers.insert(peer)
    }

    fn remove(&mut self, peer: &Identity) -> bool {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn members(&self) -> Vec<Identity> {
        self.peers.iter().copied().collect()
    }
}

#[derive(Debug)]
struct CachedMessage {
    message: GossipMessage,
    inserted: Instant,
}

struct PingState {
    last_sent: Instant,
    outstanding: Option<(u64, Instant)>,
}

struct PeerLink {
    id: u64,
    /// Who opened the link; used to settle duplicate links.
    dialer: Identity,
    remote_addr: String,
    listen_addr: Option<String>,
    topics: HashSet<String>,
    outbound: mpsc::Sender<Vec<u8>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    ping: PingState,
    /// Peer hints still accepted from this link until the next heartbeat.
    hint_budget: usize,
}

/// Dial backoff for one peer.
#[derive(Debug)]
struct Reconnect {
    failures: u32,
    first_failure: Instant,
    next_attempt: Instant,
    past_deadline: bool,
}

impl Reconnect {
    fn new(now: Instant) -> Self {
        Self {
            failures: 0,
            first_failure: now,
            next_attempt: now,
            past_deadline: false,
        }
    }

    fn delay(&self, config: &OverlayConfig) -> Duration {
        if self.past_deadline {
            return config.reconnect_max;
        }
        let exponent = self.failures.saturating_sub(1).min(16);
        config
            .reconnect_base
            .saturating_mul(1u32 << exponent)
            .min(config.reconnect_max)
    }

    /// Returns `true` the first time the failures span the unreachable deadline.
    fn record_failure(&mut self, now: Instant, config: &OverlayConfig) -> bool {
        self.failures += 1;
        let crossed = !self.past_deadline
            && now.duration_since(self.first_failure) >= config.unreachable_deadline;
        if crossed {
            self.past_deadline = true;
        }
        self.next_attempt = now + self.delay(config);
        crossed
    }

    fn ready(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }
}

/// Replaces an unspecified advertised IP with the one we observed the peer on.
fn reconcile_listen_addr(advertised: Option<String>, observed: &str) -> Option<String> {
    let advertised = advertised?;
    match (advertised.parse::<SocketAddr>(), observed.parse::<SocketAddr>()) {
        (Ok(adv), Ok(obs)) if adv.ip().is_unspecified() => {
            Some(SocketAddr::new(obs.ip(), adv.port()).to_string())
        }
        _ => Some(advertised),
    }
}

fn initial_sequence() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

// ============================================================================
// Commands and events
// ============================================================================

type DialReply = oneshot::Sender<Result<(), LinkError>>;

enum Command {
    Subscribe(String, oneshot::Sender<Result<(), OverlayError>>),
    Unsubscribe(String, oneshot::Sender<Result<(), OverlayError>>),
    Publish(String, Vec<u8>, oneshot::Sender<Result<PublishReceipt, OverlayError>>),
    Connect {
        identity: Identity,
        addr: String,
        direct: bool,
        reply: Option<DialReply>,
    },
    GetSubscriptions(oneshot::Sender<Vec<String>>),
    GetMeshPeers(String, oneshot::Sender<Vec<Identity>>),
    GetLinkedPeers(oneshot::Sender<Vec<Identity>>),
    Quit {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Dialed {
        peer: Identity,
        addr: String,
        result: Result<Link, LinkError>,
    },
    Frame {
        peer: Identity,
        link_id: u64,
        frame: Frame,
    },
    LinkDown {
        peer: Identity,
        link_id: u64,
        reason: String,
    },
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct GossipOverlay {
    cmd_tx: mpsc::Sender<Command>,
    delivery_tx: broadcast::Sender<ReceivedMessage>,
    local: Identity,
}

impl GossipOverlay {
    /// Spawns the overlay actor on top of a listening channel.
    pub fn spawn(
        keypair: Keypair,
        channel: Arc<dyn SecureChannel>,
        inbound: Inbound,
        directory: PeerDirectory,
        config: OverlayConfig,
    ) -> Self {
        let delivery_tx = delivery_queue(&config);
        Self::spawn_with_delivery(keypair, channel, inbound, directory, config, delivery_tx)
    }

    /// Like [`spawn`](Self::spawn), delivering into a queue the caller may
    /// already hold subscriptions on.
    pub(crate) fn spawn_with_delivery(
        keypair: Keypair,
        channel: Arc<dyn SecureChannel>,
        inbound: Inbound,
        directory: PeerDirectory,
        config: OverlayConfig,
        delivery_tx: broadcast::Sender<ReceivedMessage>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let local = keypair.identity();

        let actor = OverlayActor::new(keypair, channel, directory, config, delivery_tx.clone(), event_tx);
        tokio::spawn(actor.run(cmd_rx, inbound, event_rx));

        Self {
            cmd_tx,
            delivery_tx,
            local,
        }
    }

    pub fn identity(&self) -> Identity {
        self.local
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OverlayError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| OverlayError::Closed)?;
        rx.await.map_err(|_| OverlayError::Closed)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), OverlayError> {
        self.request(|tx| Command::Subscribe(topic.to_string(), tx)).await?
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), OverlayError> {
        self.request(|tx| Command::Unsubscribe(topic.to_string(), tx)).await?
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<PublishReceipt, OverlayError> {
        self.request(|tx| Command::Publish(topic.to_string(), payload, tx)).await?
    }

    /// Dials a peer and waits for the outcome. Direct peers are redialed forever.
    pub async fn connect(&self, identity: Identity, addr: &str, direct: bool) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect {
                identity,
                addr: addr.to_string(),
                direct,
                reply: Some(tx),
            })
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Asks the overlay to link to a peer when its backoff allows. Does not wait.
    pub async fn add_peer(&self, identity: Identity, addr: &str) {
        let _ = self
            .cmd_tx
            .send(Command::Connect {
                identity,
                addr: addr.to_string(),
                direct: false,
                reply: None,
            })
            .await;
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.request(Command::GetSubscriptions).await.unwrap_or_default()
    }

    pub async fn mesh_peers(&self, topic: &str) -> Vec<Identity> {
        self.request(|tx| Command::GetMeshPeers(topic.to_string(), tx))
            .await
            .unwrap_or_default()
    }

    pub async fn linked_peers(&self) -> Vec<Identity> {
        self.request(Command::GetLinkedPeers).await.unwrap_or_default()
    }

    pub fn messages(&self) -> Subscription {
        Subscription::new(&self.delivery_tx)
    }

    /// Closes every link, waiting at most `grace` for queued frames to drain.
    pub async fn quit(&self, grace: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Quit { grace, done: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Link tasks
// ============================================================================

async fn write_loop(
    mut writer: Box<dyn LinkWriter>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    peer: Identity,
    link_id: u64,
    events: mpsc::Sender<Event>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.send(frame).await {
            let _ = events
                .send(Event::LinkDown {
                    peer,
                    link_id,
                    reason: e.to_string(),
                })
                .await;
            break;
        }
    }
    writer.close().await;
}

async fn read_loop(
    mut reader: Box<dyn LinkReader>,
    peer: Identity,
    link_id: u64,
    events: mpsc::Sender<Event>,
) {
    let reason = loop {
        match reader.receive().await {
            Ok(Some(bytes)) => match decode_frame(&bytes) {
                Ok(frame) => {
                    if events.send(Event::Frame { peer, link_id, frame }).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!(peer = %peer.short(), error = %e, "dropping malformed frame"),
            },
            Ok(None) => break "closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    let _ = events.send(Event::LinkDown { peer, link_id, reason }).await;
}

// ============================================================================
// Actor
// ============================================================================

struct OverlayActor {
    keypair: Keypair,
    local: Identity,
    config: OverlayConfig,
    channel: Arc<dyn SecureChannel>,
    directory: PeerDirectory,
    router: MessageRouter,
    subscriptions: HashSet<String>,
    meshes: HashMap<String, MeshView>,
    links: HashMap<Identity, PeerLink>,
    next_link_id: u64,
    dials: HashMap<Identity, JoinHandle<()>>,
    dial_waiters: HashMap<Identity, Vec<DialReply>>,
    direct_peers: HashMap<Identity, String>,
    reconnects: HashMap<Identity, Reconnect>,
    seqno_trackers: LruCache<(Identity, String), SeqnoTracker>,
    message_cache: LruCache<MessageId, CachedMessage>,
    /// Recently seen ids per topic, oldest first, for IHAVE.
    recent: HashMap<String, VecDeque<(MessageId, Instant)>>,
    /// Peers hinted as mesh members per topic, newest last; backfill only dials these.
    interested: HashMap<String, VecDeque<Identity>>,
    prune_backoff: HashMap<(Identity, String), Instant>,
    next_sequence: u64,
    delivery_tx: broadcast::Sender<ReceivedMessage>,
    event_tx: mpsc::Sender<Event>,
    last_directory_sweep: Instant,
}

impl OverlayActor {
    fn new(
        keypair: Keypair,
        channel: Arc<dyn SecureChannel>,
        directory: PeerDirectory,
        config: OverlayConfig,
        delivery_tx: broadcast::Sender<ReceivedMessage>,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        let local = keypair.identity();
        let cache_size = NonZeroUsize::new(config.message_cache_size).unwrap_or(NonZeroUsize::MIN);
        let tracked = NonZeroUsize::new(MAX_TRACKED_SENDERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            keypair,
            local,
            channel,
            router: MessageRouter::new(directory.clone()),
            directory,
            subscriptions: HashSet::new(),
            meshes: HashMap::new(),
            links: HashMap::new(),
            next_link_id: 0,
            dials: HashMap::new(),
            dial_waiters: HashMap::new(),
            direct_peers: HashMap::new(),
            reconnects: HashMap::new(),
            seqno_trackers: LruCache::new(tracked),
            message_cache: LruCache::new(cache_size),
            recent: HashMap::new(),
            interested: HashMap::new(),
            prune_backoff: HashMap::new(),
            next_sequence: initial_sequence(),
            delivery_tx,
            event_tx,
            last_directory_sweep: Instant::now(),
            config,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut inbound: Inbound,
        mut event_rx: mpsc::Receiver<Event>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Subscribe(topic, reply)) => {
                        let _ = reply.send(self.handle_subscribe_cmd(&topic));
                    }
                    Some(Command::Unsubscribe(topic, reply)) => {
                        let _ = reply.send(self.handle_unsubscribe_cmd(&topic));
                    }
                    Some(Command::Publish(topic, payload, reply)) => {
                        let _ = reply.send(self.handle_publish_cmd(&topic, payload));
                    }
                    Some(Command::Connect { identity, addr, direct, reply }) => {
                        self.handle_connect_cmd(identity, addr, direct, reply);
                    }
                    Some(Command::GetSubscriptions(reply)) => {
                        let _ = reply.send(self.subscriptions.iter().cloned().collect());
                    }
                    Some(Command::GetMeshPeers(topic, reply)) => {
                        let peers = self.meshes.get(&topic).map(MeshView::members).unwrap_or_default();
                        let _ = reply.send(peers);
                    }
                    Some(Command::GetLinkedPeers(reply)) => {
                        let _ = reply.send(self.links.keys().copied().collect());
                    }
                    Some(Command::Quit { grace, done }) => {
                        self.shutdown(grace).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        debug!("overlay handle dropped, actor quitting");
                        self.shutdown(Duration::ZERO).await;
                        break;
                    }
                },
                link = inbound.recv(), if inbound_open => match link {
                    Some(link) => {
                        let dialer = link.remote;
                        self.install_link(link, dialer).await;
                    }
                    None => {
                        debug!("secure channel stopped accepting links");
                        inbound_open = false;
                    }
                },
                Some(event) = event_rx.recv() => {
                    self.handle_event(event).await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_subscribe_cmd(&mut self, topic: &str) -> Result<(), OverlayError> {
        if !is_valid_topic(topic) {
            return Err(OverlayError::InvalidTopic(topic.to_string()));
        }
        if !self.subscriptions.insert(topic.to_string()) {
            return Ok(());
        }
        self.meshes.insert(topic.to_string(), MeshView::default());
        info!(topic = %topic, "subscribed");

        let peers: Vec<Identity> = self.links.keys().copied().collect();
        let announce = Frame::Subscribe { topic: topic.to_string() };
        self.send_to_many(&peers, &announce);

        for peer in self.graft_candidates(topic) {
            self.graft(peer, topic);
        }
        Ok(())
    }

    fn handle_unsubscribe_cmd(&mut self, topic: &str) -> Result<(), OverlayError> {
        if !self.subscriptions.remove(topic) {
            return Ok(());
        }
        let backoff_secs = self.config.prune_backoff.as_secs();
        if let Some(mesh) = self.meshes.remove(topic) {
            for peer in mesh.members() {
                self.send_frame(
                    &peer,
                    &Frame::Prune {
                        topic: topic.to_string(),
                        peers: Vec::new(),
                        backoff_secs,
                    },
                );
                self.set_backoff(peer, topic, self.config.prune_backoff);
                info!(peer = %peer.short(), topic = %topic, mesh_size = 0, "mesh peer removed");
            }
        }
        self.recent.remove(topic);
        self.interested.remove(topic);

        let peers: Vec<Identity> = self.links.keys().copied().collect();
        self.send_to_many(&peers, &Frame::Unsubscribe { topic: topic.to_string() });
        info!(topic = %topic, "unsubscribed");
        Ok(())
    }

    fn handle_publish_cmd(&mut self, topic: &str, payload: Vec<u8>) -> Result<PublishReceipt, OverlayError> {
        if !self.subscriptions.contains(topic) {
            warn!(topic = %topic, reason = "NotSubscribed", "publish refused");
            return Err(OverlayError::NotSubscribed { topic: topic.to_string() });
        }
        if payload.len() > self.config.max_payload_size {
            return Err(OverlayError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let message = GossipMessage::signed(&self.keypair, topic, sequence, payload);
        let message_id = message.id();
        self.seqno_trackers
            .get_or_insert_mut((self.local, topic.to_string()), SeqnoTracker::default)
            .check_and_record(sequence);
        self.remember(&message);

        let targets: Vec<Identity> = self
            .links
            .iter()
            .filter(|(_, link)| link.topics.contains(topic))
            .map(|(peer, _)| *peer)
            .collect();
        let recipients = self.send_to_many(&targets, &Frame::Publish(message.clone()));

        debug!(topic = %topic, sequence, recipients, "published");
        self.deliver(ReceivedMessage {
            topic: message.topic,
            sender: self.local,
            sequence,
            payload: message.payload,
            tier: None,
        });

        Ok(PublishReceipt {
            sequence,
            message_id,
            recipients,
        })
    }

    fn handle_connect_cmd(&mut self, identity: Identity, addr: String, direct: bool, reply: Option<DialReply>) {
        if identity == self.local {
            if let Some(reply) = reply {
                let _ = reply.send(Err(LinkError::InvalidAddress(addr)));
            }
            return;
        }
        if direct {
            self.direct_peers.insert(identity, addr.clone());
        }
        if self.links.contains_key(&identity) {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        let force = reply.is_some();
        if let Some(reply) = reply {
            self.dial_waiters.entry(identity).or_default().push(reply);
        }
        self.dial(identity, addr, force);
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    fn dial(&mut self, peer: Identity, addr: String, force: bool) {
        if peer == self.local || self.links.contains_key(&peer) || self.dials.contains_key(&peer) {
            return;
        }
        if !force
            && let Some(backoff) = self.reconnects.get(&peer)
            && !backoff.ready(Instant::now())
        {
            return;
        }

        trace!(peer = %peer.short(), addr = %addr, "dialing");
        let channel = self.channel.clone();
        let events = self.event_tx.clone();
        let timeout = self.config.connect_timeout;
        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, channel.connect(&addr, &peer))
                .await
                .unwrap_or(Err(LinkError::Timeout));
            let _ = events.send(Event::Dialed { peer, addr, result }).await;
        });
        self.dials.insert(peer, task);
    }

    async fn install_link(&mut self, link: Link, dialer: Identity) {
        let peer = link.remote;
        if peer == self.local {
            let Link { mut writer, .. } = link;
            tokio::spawn(async move { writer.close().await });
            return;
        }

        if let Some(existing) = self.links.get(&peer) {
            // Both ends keep the link opened by the lower identity.
            let preferred = self.local.min(peer);
            if existing.dialer == preferred || dialer != preferred {
                trace!(peer = %peer.short(), "closing duplicate link");
                let Link { mut writer, .. } = link;
                tokio::spawn(async move { writer.close().await });
                return;
            }
            self.drop_link(&peer);
        }

        let link_id = self.next_link_id;
        self.next_link_id += 1;

        let Link {
            writer,
            reader,
            remote_addr,
            ..
        } = link;
        let (outbound, outbound_rx) = mpsc::channel(self.config.link_queue_capacity);
        let writer = tokio::spawn(write_loop(writer, outbound_rx, peer, link_id, self.event_tx.clone()));
        let reader = tokio::spawn(read_loop(reader, peer, link_id, self.event_tx.clone()));

        let now = Instant::now();
        self.links.insert(
            peer,
            PeerLink {
                id: link_id,
                dialer,
                remote_addr: remote_addr.clone(),
                listen_addr: None,
                topics: HashSet::new(),
                outbound,
                writer,
                reader,
                ping: PingState {
                    last_sent: now,
                    outstanding: None,
                },
                hint_budget: HINTS_PER_HEARTBEAT,
            },
        );
        self.reconnects.remove(&peer);
        self.directory.mark_seen(&peer).await;

        let hello = Frame::Hello {
            listen_addr: self.channel.local_addr(),
            topics: self.subscriptions.iter().cloned().collect(),
        };
        self.send_frame(&peer, &hello);

        info!(
            peer = %peer.short(),
            addr = %remote_addr,
            outbound = dialer == self.local,
            "link up"
        );
    }

    /// Removes a link and its mesh memberships. The writer drains in the background.
    fn drop_link(&mut self, peer: &Identity) -> Option<JoinHandle<()>> {
        let PeerLink {
            outbound,
            writer,
            reader,
            ..
        } = self.links.remove(peer)?;
        drop(outbound);
        reader.abort();

        for (topic, mesh) in self.meshes.iter_mut() {
            if mesh.remove(peer) {
                info!(peer = %peer.short(), topic = %topic, mesh_size = mesh.len(), "mesh peer removed");
            }
        }
        Some(writer)
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Dialed { peer, addr, result } => {
                self.dials.remove(&peer);
                match result {
                    Ok(link) => {
                        self.install_link(link, self.local).await;
                        self.resolve_waiters(&peer, Ok(()));
                    }
                    Err(e) => {
                        warn!(peer = %peer.short(), addr = %addr, error = %e, "LinkError: dial failed");
                        self.record_dial_failure(peer).await;
                        self.resolve_waiters(&peer, Err(e));
                    }
                }
            }
            Event::Frame { peer, link_id, frame } => {
                if self.links.get(&peer).is_some_and(|l| l.id == link_id) {
                    trace!(peer = %peer.short(), kind = frame.kind(), "frame received");
                    self.handle_frame(peer, frame).await;
                }
            }
            Event::LinkDown { peer, link_id, reason } => {
                if self.links.get(&peer).is_some_and(|l| l.id == link_id) {
                    warn!(peer = %peer.short(), reason = %reason, "LinkError: link lost");
                    self.drop_link(&peer);
                    if self.direct_peers.contains_key(&peer) {
                        self.reconnects
                            .entry(peer)
                            .or_insert_with(|| Reconnect::new(Instant::now()));
                    }
                }
            }
        }
    }

    fn resolve_waiters(&mut self, peer: &Identity, result: Result<(), LinkError>) {
        if let Some(waiters) = self.dial_waiters.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    async fn record_dial_failure(&mut self, peer: Identity) {
        let now = Instant::now();
        let crossed = self
            .reconnects
            .entry(peer)
            .or_insert_with(|| Reconnect::new(now))
            .record_failure(now, &self.config);

        if !self.direct_peers.contains_key(&peer) {
            self.directory.mark_unreachable(&peer).await;
        } else if crossed {
            warn!(
                peer = %peer.short(),
                deadline_secs = self.config.unreachable_deadline.as_secs(),
                "peer unreachable past deadline; dropped from active mesh, record kept"
            );
            self.directory.mark_unreachable(&peer).await;
            for mesh in self.meshes.values_mut() {
                mesh.remove(&peer);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound frames
    // ------------------------------------------------------------------

    fn send_frame(&mut self, peer: &Identity, frame: &Frame) -> bool {
        match encode_frame(frame) {
            Ok(bytes) => self.send_encoded(peer, bytes),
            Err(e) => {
                warn!(kind = frame.kind(), error = %e, "failed to encode frame");
                false
            }
        }
    }

    /// Encodes once and queues for every peer; returns how many accepted it.
    fn send_to_many(&mut self, peers: &[Identity], frame: &Frame) -> usize {
        if peers.is_empty() {
            return 0;
        }
        let bytes = match encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(kind = frame.kind(), error = %e, "failed to encode frame");
                return 0;
            }
        };
        peers
            .iter()
            .filter(|peer| self.send_encoded(peer, bytes.clone()))
            .count()
    }

    fn send_encoded(&self, peer: &Identity, bytes: Vec<u8>) -> bool {
        let Some(link) = self.links.get(peer) else {
            return false;
        };
        match link.outbound.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(peer = %peer.short(), "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_frame(&mut self, peer: Identity, frame: Frame) {
        match frame {
            Frame::Hello { listen_addr, topics } => self.handle_hello(peer, listen_addr, topics).await,
            Frame::Subscribe { topic } => {
                if !is_valid_topic(&topic) {
                    return;
                }
                debug!(peer = %peer.short(), topic = %topic, subscribed = true, "peer subscription change");
                if let Some(link) = self.links.get_mut(&peer)
                    && link.topics.len() < MAX_TOPICS_PER_PEER
                {
                    link.topics.insert(topic.clone());
                }
                self.maybe_graft(peer, &topic);
            }
            Frame::Unsubscribe { topic } => {
                debug!(peer = %peer.short(), topic = %topic, subscribed = false, "peer subscription change");
                if let Some(link) = self.links.get_mut(&peer) {
                    link.topics.remove(&topic);
                }
                self.remove_from_mesh(&peer, &topic);
            }
            Frame::Graft { topic } => self.handle_graft(peer, &topic),
            Frame::Prune {
                topic,
                peers,
                backoff_secs,
            } => {
                self.remove_from_mesh(&peer, &topic);
                let backoff = Duration::from_secs(backoff_secs.min(MAX_PRUNE_BACKOFF_SECS));
                self.set_backoff(peer, &topic, backoff.max(self.config.prune_backoff));
                self.learn_peers(peer, &topic, peers).await;
            }
            Frame::Publish(message) => self.handle_publish(peer, message).await,
            Frame::IHave { topic, ids } => self.handle_ihave(peer, &topic, ids),
            Frame::IWant { ids } => self.handle_iwant(peer, ids),
            Frame::MeshGossip { topic, peers } => {
                if self.subscriptions.contains(&topic) {
                    self.learn_peers(peer, &topic, peers).await;
                }
            }
            Frame::Ping { nonce } => {
                self.send_frame(&peer, &Frame::Pong { nonce });
            }
            Frame::Pong { nonce } => {
                if let Some(link) = self.links.get_mut(&peer)
                    && link.ping.outstanding.is_some_and(|(expected, _)| expected == nonce)
                {
                    link.ping.outstanding = None;
                    self.directory.mark_seen(&peer).await;
                }
            }
        }
    }

    async fn handle_hello(&mut self, peer: Identity, listen_addr: Option<String>, topics: Vec<String>) {
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };
        link.listen_addr = reconcile_listen_addr(listen_addr, &link.remote_addr);
        link.topics = topics
            .into_iter()
            .filter(|t| is_valid_topic(t))
            .take(MAX_TOPICS_PER_PEER)
            .collect();
        let listen_addr = link.listen_addr.clone();
        let topics: Vec<String> = link.topics.iter().cloned().collect();

        self.directory.record_inbound(peer, listen_addr).await;
        for topic in topics {
            self.maybe_graft(peer, &topic);
        }
    }

    fn handle_graft(&mut self, peer: Identity, topic: &str) {
        let backoff_secs = self.config.prune_backoff.as_secs();
        if !self.subscriptions.contains(topic) || self.in_backoff(&peer, topic) {
            self.send_frame(
                &peer,
                &Frame::Prune {
                    topic: topic.to_string(),
                    peers: Vec::new(),
                    backoff_secs,
                },
            );
            return;
        }
        if let Some(link) = self.links.get_mut(&peer)
            && link.topics.len() < MAX_TOPICS_PER_PEER
        {
            link.topics.insert(topic.to_string());
        }

        let is_direct = self.direct_peers.contains_key(&peer);
        let full = self
            .meshes
            .get(topic)
            .is_some_and(|m| m.len() >= self.config.mesh_n_high);
        if full && !is_direct {
            let peers = self.peer_hints(topic, &peer);
            self.send_frame(
                &peer,
                &Frame::Prune {
                    topic: topic.to_string(),
                    peers,
                    backoff_secs,
                },
            );
            return;
        }

        if let Some(mesh) = self.meshes.get_mut(topic)
            && mesh.insert(peer)
        {
            info!(peer = %peer.short(), topic = %topic, mesh_size = mesh.len(), "mesh peer added");
        }
    }

    async fn handle_publish(&mut self, from: Identity, message: GossipMessage) {
        if message.topic.is_empty() {
            // Nothing to forward on; admission logs the MissingTopic or UntrustedSender verdict.
            self.router.admit(&message).await;
            return;
        }
        if message.topic.len() > MAX_TOPIC_LENGTH || message.payload.len() > self.config.max_payload_size {
            debug!(peer = %from.short(), "dropping oversized message");
            return;
        }
        if !self.subscriptions.contains(&message.topic) {
            trace!(peer = %from.short(), topic = %message.topic, "dropping message for unsubscribed topic");
            return;
        }
        if let Err(e) = message.verify() {
            warn!(
                peer = %from.short(),
                sender = %message.sender.short(),
                error = %e,
                reason = "InvalidSignature",
                "dropping message"
            );
            return;
        }
        if message.sender == self.local {
            return;
        }

        let fresh = self
            .seqno_trackers
            .get_or_insert_mut((message.sender, message.topic.clone()), SeqnoTracker::default)
            .check_and_record(message.sequence);
        if !fresh {
            trace!(
                sender = %message.sender.short(),
                sequence = message.sequence,
                "duplicate or stale message dropped"
            );
            return;
        }

        self.remember(&message);

        let mut targets: HashSet<Identity> = self
            .meshes
            .get(&message.topic)
            .map(|m| m.peers.clone())
            .unwrap_or_default();
        for peer in self.direct_peers.keys() {
            if self.links.get(peer).is_some_and(|l| l.topics.contains(&message.topic)) {
                targets.insert(*peer);
            }
        }
        targets.remove(&from);
        targets.remove(&message.sender);
        let targets: Vec<Identity> = targets.into_iter().collect();
        let forwarded = self.send_to_many(&targets, &Frame::Publish(message.clone()));
        trace!(sequence = message.sequence, forwarded, "forwarded message");

        if let Admission::Accepted { tier } = self.router.admit(&message).await {
            self.deliver(ReceivedMessage {
                topic: message.topic,
                sender: message.sender,
                sequence: message.sequence,
                payload: message.payload,
                tier: Some(tier),
            });
        }
    }

    fn handle_ihave(&mut self, peer: Identity, topic: &str, ids: Vec<MessageId>) {
        if !self.subscriptions.contains(topic) {
            return;
        }
        let wanted: Vec<MessageId> = ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.message_cache.contains(id))
            .collect();
        if !wanted.is_empty() {
            self.send_frame(&peer, &Frame::IWant { ids: wanted });
        }
    }

    fn handle_iwant(&mut self, peer: Identity, ids: Vec<MessageId>) {
        let ttl = self.config.message_cache_ttl;
        let messages: Vec<GossipMessage> = ids
            .iter()
            .take(self.config.max_ihave_length)
            .filter_map(|id| self.message_cache.peek(id))
            .filter(|cached| cached.inserted.elapsed() <= ttl)
            .map(|cached| cached.message.clone())
            .collect();
        for message in messages {
            self.send_frame(&peer, &Frame::Publish(message));
        }
    }

    /// Records hinted mesh members of `topic`, within the sending link's budget.
    async fn learn_peers(&mut self, from: Identity, topic: &str, hints: Vec<PeerHint>) {
        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        let allowed = link.hint_budget.min(MAX_PEER_HINTS);
        link.hint_budget -= allowed.min(hints.len());
        if hints.len() > allowed {
            debug!(peer = %from.short(), dropped = hints.len() - allowed, "peer hint budget exhausted");
        }

        let subscribed = self.subscriptions.contains(topic);
        for hint in hints.into_iter().take(allowed) {
            if hint.identity == self.local || !hint.identity.is_valid() {
                continue;
            }
            if self.directory.record_discovered(hint.identity, hint.addr).await {
                debug!(peer = %hint.identity.short(), "learned peer from gossip");
            }
            if subscribed {
                let interested = self.interested.entry(topic.to_string()).or_default();
                if !interested.contains(&hint.identity) {
                    if interested.len() >= MAX_INTERESTED_PER_TOPIC {
                        interested.pop_front();
                    }
                    interested.push_back(hint.identity);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Mesh helpers
    // ------------------------------------------------------------------

    fn deliver(&self, message: ReceivedMessage) {
        if self.delivery_tx.send(message).is_err() {
            trace!("no subscribers for delivered message");
        }
    }

    fn remember(&mut self, message: &GossipMessage) {
        let id = message.id();
        let now = Instant::now();
        self.message_cache.put(
            id,
            CachedMessage {
                message: message.clone(),
                inserted: now,
            },
        );
        let recent = self.recent.entry(message.topic.clone()).or_default();
        recent.push_back((id, now));
        while recent.len() > self.config.max_ihave_length {
            recent.pop_front();
        }
    }

    fn in_backoff(&self, peer: &Identity, topic: &str) -> bool {
        self.prune_backoff
            .get(&(*peer, topic.to_string()))
            .is_some_and(|until| Instant::now() < *until)
    }

    fn set_backoff(&mut self, peer: Identity, topic: &str, duration: Duration) {
        if self.prune_backoff.len() >= MAX_BACKOFF_ENTRIES {
            return;
        }
        self.prune_backoff
            .insert((peer, topic.to_string()), Instant::now() + duration);
    }

    fn remove_from_mesh(&mut self, peer: &Identity, topic: &str) {
        if let Some(mesh) = self.meshes.get_mut(topic)
            && mesh.remove(peer)
        {
            info!(peer = %peer.short(), topic = %topic, mesh_size = mesh.len(), "mesh peer removed");
        }
    }

    /// Linked peers subscribed to `topic` that could join its mesh, direct peers first.
    fn graft_candidates(&self, topic: &str) -> Vec<Identity> {
        let Some(mesh) = self.meshes.get(topic) else {
            return Vec::new();
        };
        let needed = self.config.mesh_n.saturating_sub(mesh.len());
        let mut candidates: Vec<Identity> = self
            .links
            .iter()
            .filter(|(peer, link)| link.topics.contains(topic) && !mesh.contains(peer))
            .map(|(peer, _)| *peer)
            .filter(|peer| !self.in_backoff(peer, topic))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by_key(|peer| !self.direct_peers.contains_key(peer));
        candidates.truncate(needed);
        candidates
    }

    fn graft(&mut self, peer: Identity, topic: &str) {
        let Some(mesh) = self.meshes.get_mut(topic) else {
            return;
        };
        if !mesh.insert(peer) {
            return;
        }
        info!(peer = %peer.short(), topic = %topic, mesh_size = mesh.len(), "mesh peer added");
        self.send_frame(&peer, &Frame::Graft { topic: topic.to_string() });
    }

    /// Grafts a newly interested peer straight away when the mesh is short.
    fn maybe_graft(&mut self, peer: Identity, topic: &str) {
        let short = self
            .meshes
            .get(topic)
            .is_some_and(|m| m.len() < self.config.mesh_n_low && !m.contains(&peer));
        if short && !self.in_backoff(&peer, topic) {
            self.graft(peer, topic);
        }
    }

    fn peer_hints(&self, topic: &str, exclude: &Identity) -> Vec<PeerHint> {
        let Some(mesh) = self.meshes.get(topic) else {
            return Vec::new();
        };
        mesh.peers
            .iter()
            .filter(|peer| *peer != exclude)
            .filter_map(|peer| {
                let addr = self.links.get(peer)?.listen_addr.clone()?;
                Some(PeerHint { identity: *peer, addr })
            })
            .take(MAX_PEER_HINTS)
            .collect()
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let now = Instant::now();
        for link in self.links.values_mut() {
            link.hint_budget = HINTS_PER_HEARTBEAT;
        }
        self.check_liveness(now).await;

        let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
        for topic in &topics {
            self.mesh_maintenance(topic).await;
            self.emit_gossip(topic);
        }

        self.reconnect_direct_peers(now);
        self.expire_state(now).await;
    }

    async fn check_liveness(&mut self, now: Instant) {
        let mut dead = Vec::new();
        let mut pings = Vec::new();
        for (peer, link) in self.links.iter_mut() {
            match link.ping.outstanding {
                Some((_, sent)) if now.duration_since(sent) > self.config.ping_timeout => {
                    dead.push(*peer);
                }
                Some(_) => {}
                None if now.duration_since(link.ping.last_sent) >= self.config.ping_interval => {
                    let nonce = rand::random::<u64>();
                    link.ping.outstanding = Some((nonce, now));
                    link.ping.last_sent = now;
                    pings.push((*peer, nonce));
                }
                None => {}
            }
        }

        for (peer, nonce) in pings {
            self.send_frame(&peer, &Frame::Ping { nonce });
        }

        for peer in dead {
            warn!(
                peer = %peer.short(),
                timeout_ms = self.config.ping_timeout.as_millis() as u64,
                "liveness probe timed out; evicting peer"
            );
            self.drop_link(&peer);
            self.directory.mark_unreachable(&peer).await;
            if self.direct_peers.contains_key(&peer) {
                self.reconnects.entry(peer).or_insert_with(|| Reconnect::new(now));
            }
        }
    }

    async fn mesh_maintenance(&mut self, topic: &str) {
        // Members that went away or lost interest.
        let departed: Vec<Identity> = match self.meshes.get(topic) {
            Some(mesh) => mesh
                .peers
                .iter()
                .filter(|peer| !self.links.get(*peer).is_some_and(|l| l.topics.contains(topic)))
                .copied()
                .collect(),
            None => return,
        };
        for peer in departed {
            self.remove_from_mesh(&peer, topic);
        }

        let mesh_size = self.meshes.get(topic).map_or(0, MeshView::len);
        if mesh_size < self.config.mesh_n_low {
            for peer in self.graft_candidates(topic) {
                self.graft(peer, topic);
            }

            let mesh_size = self.meshes.get(topic).map_or(0, MeshView::len);
            if mesh_size < self.config.mesh_n_low {
                self.backfill(topic, self.config.mesh_n - mesh_size).await;
            }
        }

        let mesh_size = self.meshes.get(topic).map_or(0, MeshView::len);
        if mesh_size > self.config.mesh_n_high {
            let mut members = self.meshes.get(topic).map(MeshView::members).unwrap_or_default();
            members.shuffle(&mut rand::thread_rng());
            // Direct peers sort last so they are pruned only when nothing else is left.
            members.sort_by_key(|peer| self.direct_peers.contains_key(peer));
            let excess = mesh_size - self.config.mesh_n;
            let backoff_secs = self.config.prune_backoff.as_secs();
            for peer in members.into_iter().take(excess) {
                self.remove_from_mesh(&peer, topic);
                let peers = self.peer_hints(topic, &peer);
                self.send_frame(
                    &peer,
                    &Frame::Prune {
                        topic: topic.to_string(),
                        peers,
                        backoff_secs,
                    },
                );
                self.set_backoff(peer, topic, self.config.prune_backoff);
            }
            debug!(topic = %topic, pruned = excess, "mesh maintenance: pruned excess peers");
        }
    }

    /// Dials directory peers hinted as members of `topic`, up to `max_links`.
    async fn backfill(&mut self, topic: &str, wanted: usize) {
        let room = self
            .config
            .max_links
            .saturating_sub(self.links.len() + self.dials.len());
        let wanted = wanted.min(room);
        if wanted == 0 {
            return;
        }
        let Some(interested) = self.interested.get(topic) else {
            return;
        };
        let interested: HashSet<Identity> = interested.iter().copied().collect();

        let mut exclude: HashSet<Identity> = self.links.keys().copied().collect();
        exclude.extend(self.dials.keys().copied());
        exclude.insert(self.local);
        let now = Instant::now();
        exclude.extend(
            self.reconnects
                .iter()
                .filter(|(_, backoff)| !backoff.ready(now))
                .map(|(peer, _)| *peer),
        );

        let candidates: Vec<(Identity, String)> = self
            .directory
            .dial_candidates(&exclude, usize::MAX)
            .await
            .into_iter()
            .filter(|(peer, _)| interested.contains(peer))
            .take(wanted)
            .collect();
        if !candidates.is_empty() {
            debug!(topic = %topic, candidates = candidates.len(), "mesh below minimum, backfilling from directory");
        }
        for (peer, addr) in candidates {
            self.dial(peer, addr, false);
        }
    }

    fn emit_gossip(&mut self, topic: &str) {
        let Some(mesh) = self.meshes.get(topic) else {
            return;
        };
        let mut lazy: Vec<Identity> = self
            .links
            .iter()
            .filter(|(peer, link)| link.topics.contains(topic) && !mesh.contains(peer))
            .map(|(peer, _)| *peer)
            .collect();
        if lazy.is_empty() {
            return;
        }
        lazy.shuffle(&mut rand::thread_rng());
        lazy.truncate(self.config.gossip_lazy);

        let window = self.config.heartbeat_interval * GOSSIP_HISTORY_HEARTBEATS;
        let ids: Vec<MessageId> = self
            .recent
            .get(topic)
            .map(|recent| {
                recent
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() <= window)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        for peer in lazy {
            if !ids.is_empty() {
                self.send_frame(
                    &peer,
                    &Frame::IHave {
                        topic: topic.to_string(),
                        ids: ids.clone(),
                    },
                );
            }
            let hints = self.peer_hints(topic, &peer);
            if !hints.is_empty() {
                self.send_frame(
                    &peer,
                    &Frame::MeshGossip {
                        topic: topic.to_string(),
                        peers: hints,
                    },
                );
            }
        }
    }

    fn reconnect_direct_peers(&mut self, now: Instant) {
        let due: Vec<(Identity, String)> = self
            .direct_peers
            .iter()
            .filter(|(peer, _)| !self.links.contains_key(*peer) && !self.dials.contains_key(*peer))
            .filter(|(peer, _)| self.reconnects.get(*peer).is_none_or(|r| r.ready(now)))
            .map(|(peer, addr)| (*peer, addr.clone()))
            .collect();
        for (peer, addr) in due {
            debug!(peer = %peer.short(), "redialing direct peer");
            self.dial(peer, addr, false);
        }
    }

    async fn expire_state(&mut self, now: Instant) {
        self.prune_backoff.retain(|_, until| *until > now);

        let ttl = self.config.message_cache_ttl;
        loop {
            let expired = matches!(
                self.message_cache.peek_lru(),
                Some((_, cached)) if now.duration_since(cached.inserted) > ttl
            );
            if !expired {
                break;
            }
            self.message_cache.pop_lru();
        }

        let window = self.config.heartbeat_interval * GOSSIP_HISTORY_HEARTBEATS;
        for recent in self.recent.values_mut() {
            while recent.front().is_some_and(|(_, seen)| now.duration_since(*seen) > window) {
                recent.pop_front();
            }
        }

        if now.duration_since(self.last_directory_sweep) >= DIRECTORY_SWEEP_INTERVAL {
            self.last_directory_sweep = now;
            let evicted = self.directory.evict_stale(self.config.directory_retention).await;
            for peer in &evicted {
                self.reconnects.remove(peer);
            }
            if !evicted.is_empty() {
                debug!(evicted = evicted.len(), "removed stale directory records");
            }
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        let started = Instant::now();
        for (_, task) in self.dials.drain() {
            task.abort();
        }
        for (_, waiters) in self.dial_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(LinkError::Closed));
            }
        }

        let peers: Vec<Identity> = self.links.keys().copied().collect();
        let writers: Vec<JoinHandle<()>> = peers.iter().filter_map(|p| self.drop_link(p)).collect();
        let aborts: Vec<_> = writers.iter().map(JoinHandle::abort_handle).collect();
        let closing = writers.len();

        if tokio::time::timeout(grace, futures::future::join_all(writers))
            .await
            .is_err()
        {
            warn!(links = closing, grace_ms = grace.as_millis() as u64, "grace period elapsed; force-closing links");
            for abort in aborts {
                abort.abort();
            }
        }

        self.channel.shutdown(grace.saturating_sub(started.elapsed())).await;
        info!(links = closing, "overlay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryNetwork;
    use crate::directory::PeerRecord;
    use std::sync::atomic::{AtomicU32, Ordering};

    static ADDR_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn mem_addr() -> String {
        format!("mem:overlay-{}", ADDR_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    fn fast_config() -> OverlayConfig {
        OverlayConfig {
            heartbeat_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(500),
            reconnect_base: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            ..OverlayConfig::default()
        }
    }

    async fn spawn_overlay(net: &MemoryNetwork, directory: PeerDirectory) -> (GossipOverlay, String) {
        spawn_overlay_with(net, directory, fast_config()).await
    }

    async fn spawn_overlay_with(
        net: &MemoryNetwork,
        directory: PeerDirectory,
        config: OverlayConfig,
    ) -> (GossipOverlay, String) {
        let keypair = Keypair::generate();
        let addr = mem_addr();
        let channel = Arc::new(net.channel(keypair.identity(), addr.clone()));
        let inbound = channel.listen().await.unwrap();
        let overlay = GossipOverlay::spawn(keypair, channel, inbound, directory, config);
        (overlay, addr)
    }

    /// A hand-driven peer speaking raw frames.
    struct RawPeer {
        keypair: Keypair,
        link: Link,
    }

    impl RawPeer {
        async fn connect(net: &MemoryNetwork, target: Identity, addr: &str) -> Self {
            let keypair = Keypair::generate();
            let channel = net.channel(keypair.identity(), mem_addr());
            let link = channel.connect(addr, &target).await.unwrap();
            Self { keypair, link }
        }

        async fn send(&mut self, frame: Frame) {
            self.link.writer.send(encode_frame(&frame).unwrap()).await.unwrap();
        }

        fn message(&self, topic: &str, sequence: u64) -> GossipMessage {
            GossipMessage::signed(&self.keypair, topic, sequence, format!("m{sequence}").into_bytes())
        }

        fn identity(&self) -> Identity {
            self.keypair.identity()
        }

        /// Reads frames until one matches `want`, skipping the rest.
        async fn expect_frame(&mut self, wait: Duration, want: impl Fn(&Frame) -> bool) -> Option<Frame> {
            tokio::time::timeout(wait, async {
                loop {
                    match self.link.reader.receive().await {
                        Ok(Some(bytes)) => {
                            if let Ok(frame) = decode_frame(&bytes)
                                && want(&frame)
                            {
                                return Some(frame);
                            }
                        }
                        _ => return None,
                    }
                }
            })
            .await
            .ok()
            .flatten()
        }
    }

    fn hint(identity: Identity, addr: &str) -> PeerHint {
        PeerHint {
            identity,
            addr: addr.to_string(),
        }
    }

    async fn wait_until<F, Fut>(wait: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(wait, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    async fn trust(directory: &PeerDirectory, identity: Identity) {
        directory
            .upsert(PeerRecord::configured(identity, Tier::Tier2, "mem:unused"))
            .await;
    }

    async fn next_within(sub: &mut Subscription, wait: Duration) -> Option<ReceivedMessage> {
        tokio::time::timeout(wait, sub.recv()).await.ok().flatten()
    }

    #[test]
    fn config_defaults_are_sane() {
        let config = OverlayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mesh_n, 6);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert!(config.mesh_n_low <= config.mesh_n && config.mesh_n <= config.mesh_n_high);
    }

    #[test]
    fn config_rejects_inverted_mesh_bounds() {
        let config = OverlayConfig {
            mesh_n_low: 8,
            mesh_n: 6,
            ..OverlayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn seqno_tracker_drops_duplicates() {
        let mut tracker = SeqnoTracker::default();
        assert!(tracker.check_and_record(10));
        assert!(!tracker.check_and_record(10));
        assert!(tracker.check_and_record(11));
        assert!(!tracker.check_and_record(11));
    }

    #[test]
    fn seqno_tracker_accepts_out_of_order_within_window() {
        let mut tracker = SeqnoTracker::default();
        assert!(tracker.check_and_record(500));
        assert!(tracker.check_and_record(450));
        assert!(tracker.check_and_record(499));
        assert!(!tracker.check_and_record(450));
        assert!(tracker.check_and_record(500 - (SEQNO_WINDOW_SIZE - 1)));
    }

    #[test]
    fn seqno_older_than_window_is_rejected_as_stale() {
        let mut tracker = SeqnoTracker::default();
        assert!(tracker.check_and_record(1_000));
        // Never seen before, but outside the window: stale, not new.
        assert!(!tracker.check_and_record(1_000 - SEQNO_WINDOW_SIZE));
        assert!(!tracker.check_and_record(1));
    }

    #[test]
    fn seqno_window_slides_forward() {
        let mut tracker = SeqnoTracker::default();
        assert!(tracker.check_and_record(1));
        assert!(tracker.check_and_record(1 + 10 * SEQNO_WINDOW_SIZE));
        assert!(!tracker.check_and_record(1));
        assert!(tracker.check_and_record(10 * SEQNO_WINDOW_SIZE));
    }

    #[test]
    fn reconnect_backoff_doubles_up_to_max() {
        let config = OverlayConfig {
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(1_000),
            unreachable_deadline: Duration::from_secs(3600),
            ..OverlayConfig::default()
        };
        let start = Instant::now();
        let mut backoff = Reconnect::new(start);
        let mut delays = Vec::new();
        for _ in 0..6 {
            backoff.record_failure(start, &config);
            delays.push(backoff.delay(&config).as_millis());
        }
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn reconnect_reports_deadline_once() {
        let config = OverlayConfig {
            unreachable_deadline: Duration::from_secs(10),
            ..OverlayConfig::default()
        };
        let start = Instant::now();
        let mut backoff = Reconnect::new(start);
        assert!(!backoff.record_failure(start + Duration::from_secs(5), &config));
        assert!(backoff.record_failure(start + Duration::from_secs(11), &config));
        assert!(!backoff.record_failure(start + Duration::from_secs(20), &config));
        assert_eq!(backoff.delay(&config), config.reconnect_max);
    }

    #[test]
    fn unspecified_listen_ip_is_replaced_by_observed_ip() {
        assert_eq!(
            reconcile_listen_addr(Some("0.0.0.0:5001".into()), "192.168.1.7:40000"),
            Some("192.168.1.7:5001".into())
        );
        assert_eq!(
            reconcile_listen_addr(Some("10.0.0.1:5001".into()), "192.168.1.7:40000"),
            Some("10.0.0.1:5001".into())
        );
        assert_eq!(reconcile_listen_addr(None, "192.168.1.7:40000"), None);
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("x"));
        assert!(is_valid_topic("did:tiermesh:abcd"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(&"a".repeat(MAX_TOPIC_LENGTH + 1)));
        assert!(!is_valid_topic("bad\ntopic"));
    }

    #[tokio::test]
    async fn publish_after_unsubscribe_is_not_subscribed() {
        let net = MemoryNetwork::new();
        let (overlay, _) = spawn_overlay(&net, PeerDirectory::new()).await;

        overlay.subscribe("x").await.unwrap();
        overlay.unsubscribe("x").await.unwrap();

        assert_eq!(
            overlay.publish("x", b"payload".to_vec()).await,
            Err(OverlayError::NotSubscribed { topic: "x".into() })
        );
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let net = MemoryNetwork::new();
        let (overlay, _) = spawn_overlay(&net, PeerDirectory::new()).await;

        overlay.subscribe("x").await.unwrap();
        overlay.subscribe("x").await.unwrap();

        assert_eq!(overlay.subscriptions().await, vec!["x".to_string()]);
        assert!(matches!(overlay.subscribe("").await, Err(OverlayError::InvalidTopic(_))));
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn local_publish_is_delivered_once() {
        let net = MemoryNetwork::new();
        let (overlay, _) = spawn_overlay(&net, PeerDirectory::new()).await;
        let mut sub = overlay.messages();
        overlay.subscribe("x").await.unwrap();

        let receipt = overlay.publish("x", b"hello".to_vec()).await.unwrap();
        assert_eq!(receipt.recipients, 0);

        let received = next_within(&mut sub, Duration::from_secs(1)).await.expect("local delivery");
        assert_eq!(received.payload, b"hello");
        assert_eq!(received.sender, overlay.identity());
        assert_eq!(received.tier, None);
        assert!(next_within(&mut sub, Duration::from_millis(100)).await.is_none());
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn duplicate_message_is_delivered_exactly_once() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let (overlay, addr) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();
        let mut sub = overlay.messages();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        trust(&directory, raw.keypair.identity()).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;

        let message = raw.message("x", 42);
        raw.send(Frame::Publish(message.clone())).await;
        raw.send(Frame::Publish(message.clone())).await;

        let received = next_within(&mut sub, Duration::from_secs(2)).await.expect("first delivery");
        assert_eq!(received.sequence, 42);
        assert_eq!(received.payload, message.payload);
        assert_eq!(received.tier, Some(Tier::Tier2));
        assert!(next_within(&mut sub, Duration::from_millis(300)).await.is_none());
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn stale_sequence_is_not_delivered() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let (overlay, addr) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();
        let mut sub = overlay.messages();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        trust(&directory, raw.keypair.identity()).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;

        let newest = 10_000;
        let stale = newest - SEQNO_WINDOW_SIZE - 72;
        let in_window = newest - 5;
        for sequence in [newest, stale, in_window] {
            let message = raw.message("x", sequence);
            raw.send(Frame::Publish(message)).await;
        }

        let first = next_within(&mut sub, Duration::from_secs(2)).await.unwrap();
        let second = next_within(&mut sub, Duration::from_secs(2)).await.unwrap();
        assert_eq!((first.sequence, second.sequence), (newest, in_window));
        assert!(next_within(&mut sub, Duration::from_millis(300)).await.is_none());
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn untrusted_sender_is_not_delivered() {
        let net = MemoryNetwork::new();
        let (overlay, addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        overlay.subscribe("x").await.unwrap();
        let mut sub = overlay.messages();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;
        let message = raw.message("x", 1);
        raw.send(Frame::Publish(message)).await;

        assert!(next_within(&mut sub, Duration::from_millis(400)).await.is_none());
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn forged_signature_is_dropped() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let (overlay, addr) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();
        let mut sub = overlay.messages();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        trust(&directory, raw.keypair.identity()).await;
        let mut message = raw.message("x", 7);
        message.payload = b"tampered".to_vec();
        raw.send(Frame::Publish(message)).await;

        assert!(next_within(&mut sub, Duration::from_millis(400)).await.is_none());
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn subscribed_peer_joins_mesh() {
        let net = MemoryNetwork::new();
        let (overlay, addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        overlay.subscribe("x").await.unwrap();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;

        let peer = raw.keypair.identity();
        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if overlay.mesh_peers("x").await.contains(&peer) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(joined.is_ok(), "peer never grafted");
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn silent_peer_is_evicted_and_marked_unreachable() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let config = OverlayConfig {
            ping_interval: Duration::from_millis(40),
            ping_timeout: Duration::from_millis(120),
            ..fast_config()
        };
        let (overlay, addr) = spawn_overlay_with(&net, directory.clone(), config).await;
        overlay.subscribe("x").await.unwrap();

        // Never reads, never answers pings.
        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;
        let peer = raw.keypair.identity();

        let evicted = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let linked = overlay.linked_peers().await;
                if !linked.contains(&peer)
                    && let Some(record) = directory.lookup(&peer).await
                    && !record.is_reachable()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        assert!(evicted.is_ok(), "silent peer was never evicted");
        assert!(overlay.mesh_peers("x").await.is_empty());
        assert!(directory.lookup(&peer).await.is_some(), "record must persist");
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn connect_to_unreachable_peer_reports_link_error() {
        let net = MemoryNetwork::new();
        let (overlay, _) = spawn_overlay(&net, PeerDirectory::new()).await;
        let ghost = Keypair::generate().identity();

        let result = overlay.connect(ghost, "mem:nobody-home", true).await;

        assert!(matches!(result, Err(LinkError::Unreachable(_))));
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn ihave_for_unseen_message_is_answered_with_iwant() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let (overlay, addr) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();
        let mut sub = overlay.messages();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        trust(&directory, raw.identity()).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;

        let missed = raw.message("x", 9);
        raw.send(Frame::IHave { topic: "x".into(), ids: vec![missed.id()] }).await;

        let wanted = missed.id();
        let reply = raw
            .expect_frame(Duration::from_secs(2), |f| matches!(f, Frame::IWant { ids } if ids.contains(&wanted)))
            .await;
        assert!(reply.is_some(), "no IWant for an unseen id");

        raw.send(Frame::Publish(missed.clone())).await;
        let repaired = next_within(&mut sub, Duration::from_secs(2)).await.expect("repaired delivery");
        assert_eq!(repaired.payload, missed.payload);
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn iwant_is_served_from_the_message_cache() {
        let net = MemoryNetwork::new();
        let (overlay, addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        overlay.subscribe("x").await.unwrap();
        let receipt = overlay.publish("x", b"cached".to_vec()).await.unwrap();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::IWant { ids: vec![receipt.message_id] }).await;

        let served = raw
            .expect_frame(Duration::from_secs(2), |f| matches!(f, Frame::Publish(_)))
            .await;
        match served {
            Some(Frame::Publish(message)) => {
                assert_eq!(message.payload, b"cached");
                assert_eq!(message.sequence, receipt.sequence);
            }
            other => panic!("expected cached publish, got {other:?}"),
        }
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn graft_during_backoff_is_refused_with_prune() {
        let net = MemoryNetwork::new();
        let (overlay, addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        overlay.subscribe("x").await.unwrap();
        let overlay = &overlay;

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;
        let peer = raw.identity();
        assert!(wait_until(Duration::from_secs(2), move || async move { overlay.mesh_peers("x").await.contains(&peer) }).await);

        raw.send(Frame::Prune { topic: "x".into(), peers: Vec::new(), backoff_secs: 60 }).await;
        raw.send(Frame::Graft { topic: "x".into() }).await;

        let refused = raw
            .expect_frame(Duration::from_secs(2), |f| matches!(f, Frame::Prune { topic, .. } if topic == "x"))
            .await;
        assert!(refused.is_some(), "graft in backoff was not refused");
        assert!(!overlay.mesh_peers("x").await.contains(&peer));
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn prune_hints_reach_the_directory() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let (overlay, addr) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        let hinted = Keypair::generate().identity();
        raw.send(Frame::Prune {
            topic: "x".into(),
            peers: vec![hint(hinted, "mem:hinted")],
            backoff_secs: 60,
        })
        .await;

        let dir = &directory;
        assert!(wait_until(Duration::from_secs(2), move || async move { dir.lookup(&hinted).await.is_some() }).await);
        let record = directory.lookup(&hinted).await.unwrap();
        assert_eq!(record.tier, Tier::Unknown);
        assert_eq!(record.primary_addr(), Some("mem:hinted"));
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn oversized_mesh_is_trimmed_to_target() {
        let net = MemoryNetwork::new();
        let config = OverlayConfig {
            mesh_n_low: 1,
            mesh_n: 2,
            mesh_n_high: 3,
            ..fast_config()
        };
        let (overlay, _) = spawn_overlay_with(&net, PeerDirectory::new(), config).await;
        overlay.subscribe("x").await.unwrap();
        let local = overlay.identity();

        // Direct peers are accepted past mesh_n_high; the heartbeat trims them.
        let mut others = Vec::new();
        for _ in 0..4 {
            let (other, other_addr) = spawn_overlay(&net, PeerDirectory::new()).await;
            other.subscribe("x").await.unwrap();
            overlay.connect(other.identity(), &other_addr, true).await.unwrap();
            others.push(other);
        }

        let others_ref = &others;
        let overlay_ref = &overlay;
        let settled = move || async move {
            let mut meshed_back = 0;
            for other in others_ref {
                if other.mesh_peers("x").await.contains(&local) {
                    meshed_back += 1;
                }
            }
            overlay_ref.mesh_peers("x").await.len() == 2 && meshed_back == 2
        };
        assert!(wait_until(Duration::from_secs(3), settled).await, "mesh was never trimmed");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(settled().await, "pruned peers grafted back during backoff");

        for other in &others {
            other.quit(Duration::from_millis(100)).await;
        }
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn mesh_members_are_gossiped_to_non_mesh_peers() {
        let net = MemoryNetwork::new();
        let config = OverlayConfig {
            mesh_n_low: 1,
            mesh_n: 1,
            mesh_n_high: 2,
            ..fast_config()
        };
        let (overlay, addr) = spawn_overlay_with(&net, PeerDirectory::new(), config).await;
        overlay.subscribe("x").await.unwrap();
        let overlay = &overlay;

        let (member, member_addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        member.subscribe("x").await.unwrap();
        overlay.connect(member.identity(), &member_addr, false).await.unwrap();
        let member_id = member.identity();
        assert!(wait_until(Duration::from_secs(2), move || async move { overlay.mesh_peers("x").await.contains(&member_id) }).await);

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;

        let gossip = raw
            .expect_frame(Duration::from_secs(2), |f| {
                matches!(f, Frame::MeshGossip { topic, peers } if topic == "x" && peers.iter().any(|p| p.identity == member_id))
            })
            .await;
        match gossip {
            Some(Frame::MeshGossip { peers, .. }) => {
                let advertised = peers.iter().find(|p| p.identity == member_id).map(|p| p.addr.clone());
                assert_eq!(advertised, Some(member_addr.clone()));
            }
            other => panic!("expected mesh gossip, got {other:?}"),
        }
        assert!(!overlay.mesh_peers("x").await.contains(&raw.identity()));

        member.quit(Duration::from_millis(100)).await;
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn quit_force_closes_stuck_links_after_grace() {
        let net = MemoryNetwork::new();
        let (overlay, addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        overlay.subscribe("x").await.unwrap();
        let overlay = &overlay;

        // Never reads, so its link's writer blocks once the pipe is full.
        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;
        let peer = raw.identity();
        assert!(wait_until(Duration::from_secs(2), move || async move { overlay.mesh_peers("x").await.contains(&peer) }).await);
        for _ in 0..(DEFAULT_LINK_QUEUE_CAPACITY * 3) {
            overlay.publish("x", b"backlog".to_vec()).await.unwrap();
        }

        let grace = Duration::from_millis(150);
        let started = Instant::now();
        let quit = tokio::time::timeout(Duration::from_secs(2), overlay.quit(grace)).await;

        assert!(quit.is_ok(), "quit hung on a stuck link");
        assert!(started.elapsed() >= grace);
        drop(raw);
    }

    #[tokio::test]
    async fn peer_hints_are_budgeted_per_heartbeat() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let config = OverlayConfig {
            heartbeat_interval: Duration::from_secs(30),
            ..fast_config()
        };
        let (overlay, addr) = spawn_overlay_with(&net, directory.clone(), config).await;
        overlay.subscribe("x").await.unwrap();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        for round in 0..20 {
            let peers = (0..MAX_PEER_HINTS)
                .map(|i| hint(Keypair::generate().identity(), &format!("mem:hint-{round}-{i}")))
                .collect();
            raw.send(Frame::MeshGossip { topic: "x".into(), peers }).await;
        }
        // Ping round-trips through the actor after every MeshGossip frame.
        raw.send(Frame::Ping { nonce: 7 }).await;
        assert!(raw.expect_frame(Duration::from_secs(2), |f| *f == Frame::Pong { nonce: 7 }).await.is_some());

        assert_eq!(directory.len().await, HINTS_PER_HEARTBEAT);
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn hostile_hints_cannot_grow_directory_past_capacity() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::with_capacity(64);
        let (overlay, addr) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        for round in 0..200 {
            let peers = (0..MAX_PEER_HINTS)
                .map(|i| hint(Keypair::generate().identity(), &format!("mem:flood-{round}-{i}")))
                .collect();
            raw.send(Frame::MeshGossip { topic: "x".into(), peers }).await;
            if round % 20 == 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
        raw.send(Frame::Ping { nonce: 1 }).await;
        assert!(raw.expect_frame(Duration::from_secs(5), |f| *f == Frame::Pong { nonce: 1 }).await.is_some());

        assert!(directory.len().await <= 64);
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn backfill_skips_topics_without_interested_peers() {
        let net = MemoryNetwork::new();
        let directory = PeerDirectory::new();
        let (overlay, _) = spawn_overlay(&net, directory.clone()).await;
        overlay.subscribe("x").await.unwrap();

        let mut others = Vec::new();
        for _ in 0..5 {
            let (other, other_addr) = spawn_overlay(&net, PeerDirectory::new()).await;
            directory.record_discovered(other.identity(), other_addr).await;
            others.push(other);
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(overlay.linked_peers().await.is_empty());

        for other in &others {
            other.quit(Duration::from_millis(100)).await;
        }
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn backfill_respects_max_links() {
        let net = MemoryNetwork::new();
        let config = OverlayConfig {
            max_links: 3,
            mesh_n_low: 2,
            mesh_n: 3,
            mesh_n_high: 4,
            ..fast_config()
        };
        let (overlay, addr) = spawn_overlay_with(&net, PeerDirectory::new(), config).await;
        overlay.subscribe("x").await.unwrap();
        let overlay = &overlay;

        let mut others = Vec::new();
        let mut hints = Vec::new();
        for _ in 0..4 {
            let (other, other_addr) = spawn_overlay(&net, PeerDirectory::new()).await;
            other.subscribe("x").await.unwrap();
            hints.push(hint(other.identity(), &other_addr));
            others.push(other);
        }

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Hello { listen_addr: None, topics: vec!["x".into()] }).await;
        raw.send(Frame::MeshGossip { topic: "x".into(), peers: hints }).await;

        assert!(wait_until(Duration::from_secs(2), move || async move { overlay.linked_peers().await.len() == 3 }).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(overlay.linked_peers().await.len(), 3);

        for other in &others {
            other.quit(Duration::from_millis(100)).await;
        }
        overlay.quit(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn peer_unsubscribe_leaves_the_mesh() {
        let net = MemoryNetwork::new();
        let (overlay, addr) = spawn_overlay(&net, PeerDirectory::new()).await;
        overlay.subscribe("x").await.unwrap();
        let overlay = &overlay;

        let mut raw = RawPeer::connect(&net, overlay.identity(), &addr).await;
        raw.send(Frame::Subscribe { topic: "x".into() }).await;
        let peer = raw.identity();
        assert!(wait_until(Duration::from_secs(2), move || async move { overlay.mesh_peers("x").await.contains(&peer) }).await);

        raw.send(Frame::Unsubscribe { topic: "x".into() }).await;
        assert!(wait_until(Duration::from_secs(2), || async { !overlay.mesh_peers("x").await.contains(&peer) }).await);
        overlay.quit(Duration::from_millis(100)).await;
    }
}
