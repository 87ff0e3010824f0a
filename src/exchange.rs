//! # Gossip Peer Exchange
//!
//! [`PeerExchangeStrategy`] produces the working set of candidate addresses
//! for discovery rounds and decides whether a round should be redone. It runs
//! continuously in the background, independent of any single message, to keep
//! the local peer group populated.
//!
//! ## Candidate tiers
//!
//! Initial (bootstrap) rounds draw from four tiers in priority order, each
//! filtered against the used-address book, the ban list, the local address,
//! and the staleness cutoff:
//!
//! 1. shuffled seed addresses (bounded count)
//! 2. reported peers, lowest connection load first, then most recent
//! 3. persisted peers, most recent first
//! 4. currently connected non-seed peers
//!
//! Ongoing rounds skip tier 1 entirely; seeds are only for bootstrap. An
//! address that is simultaneously a seed and reported counts as a seed, so
//! the seed check runs before any reported-pool consideration.
//!
//! When the filtered result is empty the used-address memory is cleared once
//! and the computation retried: peers contacted in an earlier round may now
//! offer different neighbors.
//!
//! The strategy is a plain synchronous struct. Connection state is passed in
//! as an explicit [`ConnectionCensus`] snapshot, so no cross-component locks
//! are held while candidates are computed.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::debug;

use crate::peers::{Address, BanList, Peer, UsedAddressBook};

/// Tunable parameters for discovery rounds.
#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    /// Connection count the node tries to maintain.
    pub target_connections: usize,
    /// Floor below which discovery becomes aggressive.
    pub min_connections: usize,
    /// Hard bound on the reported-peer pool.
    pub max_reported_peers: usize,
    /// Maximum peers handed to a requester in one gossip report.
    pub max_report_size: usize,
    /// Seed addresses considered per bootstrap round.
    pub max_seed_candidates: usize,
    /// Reported-pool size the strategy works toward; thin pools (< 25% of
    /// this) widen the candidate bound.
    pub reported_pool_target: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            target_connections: 10,
            min_connections: 8,
            max_reported_peers: 200,
            max_report_size: 200,
            max_seed_candidates: 8,
            reported_pool_target: 100,
        }
    }
}

/// Snapshot of the node's live connections at candidate-computation time.
#[derive(Clone, Debug, Default)]
pub struct ConnectionCensus {
    pub connected: Vec<Peer>,
}

impl ConnectionCensus {
    pub fn count(&self) -> usize {
        self.connected.len()
    }
}

/// Selects and ranks candidate addresses for peer discovery.
pub struct PeerExchangeStrategy {
    config: ExchangeConfig,
    self_address: Address,
    seeds: Vec<Address>,
    ban_list: Arc<BanList>,
    used: Arc<UsedAddressBook>,
    reported: Vec<Peer>,
    persisted: Vec<Peer>,
}

impl PeerExchangeStrategy {
    pub fn new(
        config: ExchangeConfig,
        self_address: Address,
        seeds: Vec<Address>,
        ban_list: Arc<BanList>,
        used: Arc<UsedAddressBook>,
    ) -> Self {
        Self {
            config,
            self_address,
            seeds,
            ban_list,
            used,
            reported: Vec::new(),
            persisted: Vec::new(),
        }
    }

    /// Candidate addresses for a bootstrap round (seeds included).
    pub fn candidates_for_initial_exchange(&self, census: &ConnectionCensus) -> Vec<Address> {
        self.candidates(census, true)
    }

    /// Candidate addresses for an ongoing round. Seeds are excluded
    /// entirely; they exist for bootstrap only.
    pub fn candidates_for_ongoing_exchange(&self, census: &ConnectionCensus) -> Vec<Address> {
        self.candidates(census, false)
    }

    fn candidates(&self, census: &ConnectionCensus, include_seeds: bool) -> Vec<Address> {
        let mut pool = self.compute_pool(census, include_seeds);
        if pool.is_empty() && !self.used.is_empty() {
            // Peers contacted earlier may offer different neighbors now;
            // forget one round of history and retry once.
            debug!("candidate pool empty, clearing used-address memory");
            self.used.clear();
            pool = self.compute_pool(census, include_seeds);
        }

        let bound = self.candidate_bound(census);
        pool.truncate(bound);
        pool
    }

    fn compute_pool(&self, census: &ConnectionCensus, include_seeds: bool) -> Vec<Address> {
        let mut seen: HashSet<Address> = HashSet::new();
        let mut pool: Vec<Address> = Vec::new();

        let push = |addr: &Address, pool: &mut Vec<Address>, seen: &mut HashSet<Address>| {
            if seen.insert(addr.clone()) {
                pool.push(addr.clone());
            }
        };

        if include_seeds {
            let mut seeds = self.seeds.clone();
            seeds.shuffle(&mut thread_rng());
            for seed in seeds.into_iter().take(self.config.max_seed_candidates) {
                if seed != self.self_address
                    && !self.used.is_used(&seed)
                    && !self.ban_list.is_banned(&seed)
                {
                    push(&seed, &mut pool, &mut seen);
                }
            }
        }

        // Reported: lowest load first, recency breaks ties. The seed check
        // runs before anything else so a seed that was also reported never
        // enters through this tier.
        let mut reported: Vec<&Peer> = self
            .reported
            .iter()
            .filter(|p| self.usable_non_seed(p))
            .collect();
        reported.sort_by(|a, b| {
            a.load
                .cmp(&b.load)
                .then(b.last_seen_ms.cmp(&a.last_seen_ms))
        });
        for peer in reported {
            push(&peer.address, &mut pool, &mut seen);
        }

        let mut persisted: Vec<&Peer> = self
            .persisted
            .iter()
            .filter(|p| self.usable_non_seed(p))
            .collect();
        persisted.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        for peer in persisted {
            push(&peer.address, &mut pool, &mut seen);
        }

        for peer in census.connected.iter().filter(|p| self.usable_non_seed(p)) {
            push(&peer.address, &mut pool, &mut seen);
        }

        pool
    }

    /// Tier filter for everything except the seed tier: seeds never enter
    /// here, and used/self/banned/stale peers are excluded everywhere.
    fn usable_non_seed(&self, peer: &Peer) -> bool {
        !self.is_seed(&peer.address)
            && self.is_valid_peer(peer)
            && !self.used.is_used(&peer.address)
    }

    /// The validity predicate shared by candidate selection, gossip reports,
    /// and report ingestion.
    fn is_valid_peer(&self, peer: &Peer) -> bool {
        peer.address != self.self_address
            && !peer.is_stale()
            && !self.ban_list.is_banned(&peer.address)
    }

    fn is_seed(&self, address: &Address) -> bool {
        self.seeds.contains(address)
    }

    fn candidate_bound(&self, census: &ConnectionCensus) -> usize {
        let target = self.config.target_connections;
        let min = self.config.min_connections;
        let mut bound = (min / 4).max(target.saturating_sub(census.count()));
        if self.reported.len() < self.config.reported_pool_target / 4 {
            // Thin reported inventory: widen the round so gossip replies
            // refill the pool faster.
            bound = bound.max(min / 2);
        }
        bound
    }

    /// Gossip payload for a peer that asked "who do you know?".
    ///
    /// Oldest-first ordering hands out long-lived peers preferentially;
    /// the requester itself, this node, seeds, and stale entries are
    /// excluded.
    pub fn peers_to_report(&self, requester: &Address, census: &ConnectionCensus) -> Vec<Peer> {
        let mut seen: HashSet<Address> = HashSet::new();
        let mut report: Vec<Peer> = Vec::new();

        for peer in census.connected.iter().chain(self.reported.iter()) {
            if peer.address == *requester
                || self.is_seed(&peer.address)
                || !self.is_valid_peer(peer)
            {
                continue;
            }
            if seen.insert(peer.address.clone()) {
                report.push(peer.clone());
            }
        }

        report.sort_by(|a, b| a.last_seen_ms.cmp(&b.last_seen_ms));
        report.truncate(self.config.max_report_size);
        report
    }

    /// Merge a gossip report into the reported-peer pool.
    ///
    /// Entries failing the validity predicate are dropped; survivors replace
    /// any existing entry for the same address wholesale. The pool is
    /// bounded, keeping the most recently seen entries.
    pub fn ingest_reported_peers(&mut self, peers: Vec<Peer>, requester: &Address) {
        let mut accepted = 0usize;
        for peer in peers {
            if peer.address == *requester || !self.is_valid_peer(&peer) {
                continue;
            }
            self.reported.retain(|p| p.address != peer.address);
            self.reported.push(peer);
            accepted += 1;
        }

        if self.reported.len() > self.config.max_reported_peers {
            self.reported
                .sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
            self.reported.truncate(self.config.max_reported_peers);
        }

        debug!(
            from = %requester,
            accepted,
            pool = self.reported.len(),
            "ingested reported peers"
        );
    }

    /// Whether a completed bootstrap round should be redone: more than half
    /// of the attempts failed, or connections are below target, or the
    /// reported pool is below target.
    pub fn should_redo_initial_exchange(
        &self,
        successes: usize,
        attempts: usize,
        census: &ConnectionCensus,
    ) -> bool {
        let failures = attempts.saturating_sub(successes);
        failures * 2 > attempts
            || census.count() < self.config.target_connections
            || self.reported.len() < self.config.reported_pool_target
    }

    /// Remember that an address was contacted this round.
    pub fn mark_used(&self, address: &Address) {
        self.used.mark_used(address.clone());
    }

    /// Number of reported peers currently pooled.
    pub fn reported_peer_count(&self) -> usize {
        self.reported.len()
    }

    /// Seed the persisted-peer pool from a snapshot loaded at startup.
    pub fn load_persisted(&mut self, peers: Vec<Peer>) {
        self.persisted = peers;
    }

    /// Persisted-peer pool plus current reported peers, for snapshotting.
    pub fn persistable_peers(&self) -> Vec<Peer> {
        let mut seen: HashSet<Address> = HashSet::new();
        let mut out = Vec::new();
        for peer in self.reported.iter().chain(self.persisted.iter()) {
            if seen.insert(peer.address.clone()) {
                out.push(peer.clone());
            }
        }
        out
    }
}
