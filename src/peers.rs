//! # Peers, Addresses, and Shared Exclusion Sets
//!
//! Value types for the overlay's peer bookkeeping:
//!
//! - [`Address`]: transport-specific network location, the identity key for
//!   peers and ban entries
//! - [`Peer`]: a discovered remote endpoint with last-seen time and reported
//!   connection load
//! - [`NetworkId`]: address plus publisher identity, the target of a
//!   confidential send
//! - [`BanList`]: quarantined addresses, consulted by handshake and gossip
//! - [`UsedAddressBook`]: per-discovery-round de-duplication memory
//!
//! The ban list and used-address book are shared across components. They are
//! constructed explicitly and passed by reference (no ambient state); each
//! guards its map with its own lock, scoped to the whole read-decide-write
//! sequence. No caller ever holds two of these locks at once.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::identity::{now_ms, Identity};

/// Peers whose last report is older than this are excluded from discovery.
pub const MAX_PEER_AGE: Duration = Duration::from_secs(60 * 60);

/// Transport-specific network location ("host:port" or the equivalent
/// rendezvous string of the underlying anonymity transport).
///
/// Immutable value type; compared and hashed by its full string form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Address plus publisher identity: where to reach a node and which key its
/// confidential traffic is addressed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkId {
    pub address: Address,
    pub identity: Identity,
}

/// A known remote endpoint.
///
/// Created when reported by a peer-exchange response or observed via a direct
/// connection. Mutated only by wholesale replacement on re-report, never
/// partially updated. Peers are not actively destroyed; they fall out of
/// consideration once stale or quarantined.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: Address,
    /// Milliseconds since Unix epoch of the most recent report/observation.
    pub last_seen_ms: u64,
    /// Connection count the peer reported for itself.
    pub load: u32,
}

impl Peer {
    pub fn new(address: Address, load: u32) -> Self {
        Self {
            address,
            last_seen_ms: now_ms(),
            load,
        }
    }

    /// Age of the most recent report.
    pub fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_seen_ms))
    }

    pub fn is_stale(&self) -> bool {
        self.age() >= MAX_PEER_AGE
    }
}

/// Reason a peer was quarantined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanReason {
    /// Malformed or oversized traffic during handshake or gossip.
    ProtocolViolation,
    /// Answered a peer-exchange challenge on the wrong connection direction.
    WrongDirection,
    /// Quarantined by the operator or a higher layer.
    Operator,
}

#[derive(Clone, Debug)]
struct BanEntry {
    reason: BanReason,
    /// Absolute expiry in milliseconds since epoch; `None` is permanent.
    expires_at_ms: Option<u64>,
}

/// Quarantined addresses, consulted by handshake, peer exchange, and general
/// connection acceptance.
///
/// Entries added via [`ban`](Self::ban) are permanent (the historical
/// behavior); [`quarantine`](Self::quarantine) adds a time-boxed entry so the
/// expiry policy is an explicit caller decision.
#[derive(Debug, Default)]
pub struct BanList {
    inner: Mutex<HashMap<Address, BanEntry>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permanently ban an address.
    pub fn ban(&self, address: Address, reason: BanReason) {
        tracing::info!(peer = %address, reason = ?reason, "banning peer");
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        inner.insert(
            address,
            BanEntry {
                reason,
                expires_at_ms: None,
            },
        );
    }

    /// Ban an address for a bounded duration.
    pub fn quarantine(&self, address: Address, reason: BanReason, duration: Duration) {
        tracing::info!(peer = %address, reason = ?reason, secs = duration.as_secs(), "quarantining peer");
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        inner.insert(
            address,
            BanEntry {
                reason,
                expires_at_ms: Some(now_ms().saturating_add(duration.as_millis() as u64)),
            },
        );
    }

    /// Check whether an address is currently banned. Expired quarantine
    /// entries are dropped on consultation.
    pub fn is_banned(&self, address: &Address) -> bool {
        let mut inner = self.inner.lock().expect("ban list lock poisoned");
        match inner.get(address) {
            None => return false,
            Some(entry) => match entry.expires_at_ms {
                None => return true,
                Some(expiry) if now_ms() < expiry => return true,
                Some(_) => {}
            },
        }
        inner.remove(address);
        false
    }

    pub fn reason(&self, address: &Address) -> Option<BanReason> {
        let inner = self.inner.lock().expect("ban list lock poisoned");
        inner.get(address).map(|e| e.reason)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ban list lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Addresses already contacted during the current discovery round.
///
/// Shared between the exchange strategy (which excludes used addresses from
/// candidate sets and clears the memory once when a round comes up empty) and
/// the connection layer (which marks addresses as it dials them).
#[derive(Debug, Default)]
pub struct UsedAddressBook {
    inner: Mutex<HashSet<Address>>,
}

impl UsedAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_used(&self, address: Address) {
        let mut inner = self.inner.lock().expect("used address lock poisoned");
        inner.insert(address);
    }

    pub fn is_used(&self, address: &Address) -> bool {
        let inner = self.inner.lock().expect("used address lock poisoned");
        inner.contains(address)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("used address lock poisoned");
        inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("used address lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_is_not_stale() {
        let peer = Peer::new(Address::from("alpha.onion:9999"), 3);
        assert!(!peer.is_stale());
        assert!(peer.age() < Duration::from_secs(5));
    }

    #[test]
    fn old_report_is_stale() {
        let mut peer = Peer::new(Address::from("alpha.onion:9999"), 3);
        peer.last_seen_ms = now_ms() - MAX_PEER_AGE.as_millis() as u64 - 1_000;
        assert!(peer.is_stale());
    }

    #[test]
    fn permanent_ban_sticks() {
        let bans = BanList::new();
        let addr = Address::from("rogue.onion:1234");

        assert!(!bans.is_banned(&addr));
        bans.ban(addr.clone(), BanReason::WrongDirection);
        assert!(bans.is_banned(&addr));
        assert_eq!(bans.reason(&addr), Some(BanReason::WrongDirection));
    }

    #[test]
    fn quarantine_expires() {
        let bans = BanList::new();
        let addr = Address::from("rogue.onion:1234");

        bans.quarantine(addr.clone(), BanReason::ProtocolViolation, Duration::ZERO);
        // Expiry is checked on consultation; a zero-duration quarantine is
        // already past its deadline.
        assert!(!bans.is_banned(&addr));
        assert!(bans.is_empty());
    }

    #[test]
    fn used_book_marks_and_clears() {
        let used = UsedAddressBook::new();
        let addr = Address::from("alpha.onion:9999");

        used.mark_used(addr.clone());
        assert!(used.is_used(&addr));

        used.clear();
        assert!(!used.is_used(&addr));
        assert!(used.is_empty());
    }
}
