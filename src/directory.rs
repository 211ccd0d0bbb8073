//! # Peer Directory
//!
//! Shared map from peer identity to [`PeerRecord`]: trust tier, known
//! addresses, last contact and reachability.
//!
//! The directory is a cheap-to-clone handle over an async `RwLock`. Every
//! mutation takes the write lock for one identity's record, so concurrent
//! writers (overlay actor, discovery task, node startup) never lose
//! updates; readers get cloned snapshots. Last writer wins on
//! [`PeerDirectory::upsert`].
//!
//! ## Tiers
//!
//! | Tier | Source | Admitted |
//! |------|--------|----------|
//! | `Tier1` | static configuration | yes |
//! | `Tier2` | static configuration | yes |
//! | `Unknown` | discovery, peer exchange, inbound links | no |
//!
//! Unknown identities resolve to [`Tier::Unknown`], the most restrictive tier.
//!
//! ## Capacity
//!
//! Static records are never evicted. Discovered and inbound records are
//! capped at [`MAX_DISCOVERED_PEERS`]; inserting past the cap evicts the
//! least useful one (unreachable first, then the longest without contact).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::identity::Identity;

/// Upper bound on addresses remembered per peer.
pub const MAX_ADDRS_PER_PEER: usize = 4;

/// Upper bound on non-static records.
pub const MAX_DISCOVERED_PEERS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Tier1,
    Tier2,
    Unknown,
}

impl Tier {
    pub fn is_trusted(self) -> bool {
        !matches!(self, Tier::Unknown)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Tier1 => write!(f, "tier1"),
            Tier::Tier2 => write!(f, "tier2"),
            Tier::Unknown => write!(f, "unknown"),
        }
    }
}

/// How a record entered the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    /// Configured at startup. Never removed by staleness eviction.
    Static,
    Discovered,
    Inbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable { since: Instant },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: Identity,
    pub tier: Tier,
    pub addrs: Vec<String>,
    pub last_seen: Option<Instant>,
    pub reachability: Reachability,
    pub source: PeerSource,
}

impl PeerRecord {
    /// A statically configured peer.
    pub fn configured(identity: Identity, tier: Tier, addr: impl Into<String>) -> Self {
        Self {
            identity,
            tier,
            addrs: vec![addr.into()],
            last_seen: None,
            reachability: Reachability::Reachable,
            source: PeerSource::Static,
        }
    }

    pub fn discovered(identity: Identity, addr: impl Into<String>) -> Self {
        Self {
            identity,
            tier: Tier::Unknown,
            addrs: vec![addr.into()],
            last_seen: None,
            reachability: Reachability::Reachable,
            source: PeerSource::Discovered,
        }
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(String::as_str)
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self.reachability, Reachability::Reachable)
    }

    fn merge_addr(&mut self, addr: String) {
        if self.addrs.contains(&addr) {
            return;
        }
        if self.addrs.len() >= MAX_ADDRS_PER_PEER {
            self.addrs.pop();
        }
        // Newest address first: it is the one most likely to work.
        self.addrs.insert(0, addr);
    }
}

#[derive(Clone)]
pub struct PeerDirectory {
    records: Arc<RwLock<HashMap<Identity, PeerRecord>>>,
    max_discovered: usize,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::with_capacity(MAX_DISCOVERED_PEERS)
    }
}

/// Frees a slot for one more non-static record. Returns `false` if none can be freed.
fn make_room(records: &mut HashMap<Identity, PeerRecord>, max_discovered: usize) -> bool {
    let transient = records
        .values()
        .filter(|r| r.source != PeerSource::Static)
        .count();
    if transient < max_discovered {
        return true;
    }
    let victim = records
        .values()
        .filter(|r| r.source != PeerSource::Static)
        .min_by_key(|r| (r.is_reachable(), r.last_seen))
        .map(|r| r.identity);
    match victim {
        Some(identity) => records.remove(&identity).is_some(),
        None => false,
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directory holding at most `max_discovered` non-static records.
    pub fn with_capacity(max_discovered: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            max_discovered,
        }
    }

    pub async fn lookup(&self, identity: &Identity) -> Option<PeerRecord> {
        self.records.read().await.get(identity).cloned()
    }

    pub async fn tier_of(&self, identity: &Identity) -> Tier {
        self.records
            .read()
            .await
            .get(identity)
            .map(|r| r.tier)
            .unwrap_or(Tier::Unknown)
    }

    /// Inserts or replaces the record for `record.identity`, returning the previous one.
    pub async fn upsert(&self, record: PeerRecord) -> Option<PeerRecord> {
        self.records.write().await.insert(record.identity, record)
    }

    /// Notes an address learned from discovery or peer exchange.
    ///
    /// New identities enter as [`Tier::Unknown`]. Existing records keep
    /// their tier and source; only the address list and last contact change.
    /// Returns `true` when the identity was not known before.
    pub async fn record_discovered(&self, identity: Identity, addr: String) -> bool {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&identity) {
            record.merge_addr(addr);
            return false;
        }
        if !make_room(&mut records, self.max_discovered) {
            return false;
        }
        records.insert(identity, PeerRecord::discovered(identity, addr));
        true
    }

    /// Notes an inbound link from a peer that may not be in the directory yet.
    pub async fn record_inbound(&self, identity: Identity, listen_addr: Option<String>) {
        let mut records = self.records.write().await;
        if !records.contains_key(&identity) && !make_room(&mut records, self.max_discovered) {
            return;
        }
        let record = records.entry(identity).or_insert_with(|| PeerRecord {
            identity,
            tier: Tier::Unknown,
            addrs: Vec::new(),
            last_seen: None,
            reachability: Reachability::Reachable,
            source: PeerSource::Inbound,
        });
        if let Some(addr) = listen_addr {
            record.merge_addr(addr);
        }
        record.last_seen = Some(Instant::now());
        record.reachability = Reachability::Reachable;
    }

    pub async fn mark_seen(&self, identity: &Identity) {
        if let Some(record) = self.records.write().await.get_mut(identity) {
            record.last_seen = Some(Instant::now());
            record.reachability = Reachability::Reachable;
        }
    }

    /// Flags a peer as unreachable. The record itself is kept.
    pub async fn mark_unreachable(&self, identity: &Identity) {
        if let Some(record) = self.records.write().await.get_mut(identity)
            && record.is_reachable()
        {
            record.reachability = Reachability::Unreachable { since: Instant::now() };
        }
    }

    pub async fn evict(&self, identity: &Identity) -> Option<PeerRecord> {
        self.records.write().await.remove(identity)
    }

    /// Removes non-static records that have been unreachable for longer than `retention`.
    pub async fn evict_stale(&self, retention: Duration) -> Vec<Identity> {
        let mut records = self.records.write().await;
        let stale: Vec<Identity> = records
            .values()
            .filter(|r| r.source != PeerSource::Static)
            .filter(|r| match r.reachability {
                Reachability::Unreachable { since } => since.elapsed() > retention,
                Reachability::Reachable => false,
            })
            .map(|r| r.identity)
            .collect();
        for identity in &stale {
            records.remove(identity);
        }
        stale
    }

    /// Peers worth dialing: must have an address and not be excluded.
    ///
    /// Reachable before unreachable, trusted tiers before `Unknown`.
    pub async fn dial_candidates(
        &self,
        exclude: &HashSet<Identity>,
        limit: usize,
    ) -> Vec<(Identity, String)> {
        let records = self.records.read().await;
        let mut candidates: Vec<&PeerRecord> = records
            .values()
            .filter(|r| !exclude.contains(&r.identity))
            .filter(|r| r.primary_addr().is_some())
            .collect();
        candidates.sort_by_key(|r| (!r.is_reachable(), !r.tier.is_trusted()));
        candidates
            .into_iter()
            .take(limit)
            .filter_map(|r| r.primary_addr().map(|a| (r.identity, a.to_string())))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}
