//! # Replicated Signed Data Store
//!
//! A content-addressed, signed, sequence-numbered key/value store that
//! arbitrates concurrent add/remove requests deterministically without
//! coordination. The same store serves two flavors of payload:
//!
//! - **Broadcast** entries: replicated application data queried by content
//! - **Mailbox** entries: store-and-forward data addressed to a recipient
//!   key, handed over when the recipient connects and removable only by
//!   that recipient
//!
//! ## Arbitration rules
//!
//! Entries are keyed by `blake3(payload)`. Per key, the writer with the
//! highest valid sequence number wins; a request whose sequence does not
//! strictly exceed the stored one is rejected. Removal stores a tombstone
//! carrying the winning sequence, so a delayed out-of-order add can never
//! resurrect removed data. No ordering is guaranteed across different keys.
//!
//! ## Actor architecture
//!
//! - [`ReplicatedDataStore`]: public handle, cheap to clone
//! - `StoreActor`: owns the entry map; commands are processed sequentially,
//!   so every lookup-decide-mutate sequence is one atomic unit
//! - Periodic maintenance (pruning, snapshot flushing) runs inside the same
//!   actor, so reads never observe a half-pruned map
//!
//! Listeners fire only after a mutation has been committed to the
//! persistence schedule, and never for a sequence-only republish of an
//! existing entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::identity::{
    now_ms, sign_with_domain, verify_with_domain, Identity, Keypair, SignatureError,
    ENTRY_SIGNATURE_DOMAIN, REMOVE_SIGNATURE_DOMAIN,
};
use crate::messages::{wire_size, MAX_PAYLOAD_SIZE};
use crate::persist::{FlushGate, SnapshotFile};
use crate::protocols::DataStoreListener;

/// Key type for stored entries: the blake3 hash of the payload.
pub type Key = [u8; 32];

/// Per-key monotonic counter resolving concurrent add/remove without
/// coordination. Sequences start at 1; `u64::MAX` is rejected as a wrap
/// attempt since no later request could ever exceed it.
pub type SequenceNumber = u64;

/// Default time-to-live for broadcast payloads.
const BROADCAST_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Default (and maximum) time-to-live for mailbox payloads. Mailbox data
/// outlives broadcast data so offline recipients get a wider pickup window.
const MAILBOX_TTL: Duration = Duration::from_secs(15 * 24 * 60 * 60);

/// Tunable parameters for the store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Hard cap on stored entries; the newest by creation time are kept.
    pub max_entries: usize,
    /// Entries older than this are dropped regardless of their payload TTL.
    pub max_record_age: Duration,
    /// Spacing of the batched prune pass.
    pub prune_interval: Duration,
    /// Minimum spacing between snapshot writes.
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            max_record_age: Duration::from_secs(10 * 24 * 60 * 60),
            prune_interval: Duration::from_secs(10 * 60),
            flush_interval: crate::persist::MIN_FLUSH_INTERVAL,
        }
    }
}

/// Which delivery flavor a payload uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    /// Replicated broadcast data, queried by content hash.
    Broadcast,
    /// Store-and-forward data for a specific recipient key; not queried by
    /// content but delivered when the recipient connects.
    Mailbox { recipient: Identity },
}

impl PayloadKind {
    /// Upper bound on the TTL a payload of this kind may declare.
    pub fn max_ttl(&self) -> Duration {
        match self {
            PayloadKind::Broadcast => BROADCAST_TTL,
            PayloadKind::Mailbox { .. } => MAILBOX_TTL,
        }
    }
}

/// Signed application data as stored and replicated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePayload {
    pub kind: PayloadKind,
    /// Publisher key; every mutation of the entry must be signed by this key
    /// (or, for mailbox entries, removed by the recipient key).
    pub owner: Identity,
    pub data: Vec<u8>,
    pub created_at_ms: u64,
    /// Declared lifetime, bounded by the kind's maximum.
    pub ttl_ms: u64,
}

impl StorePayload {
    pub fn broadcast(owner: Identity, data: Vec<u8>) -> Self {
        Self {
            kind: PayloadKind::Broadcast,
            owner,
            data,
            created_at_ms: now_ms(),
            ttl_ms: BROADCAST_TTL.as_millis() as u64,
        }
    }

    pub fn mailbox(owner: Identity, recipient: Identity, data: Vec<u8>) -> Self {
        Self {
            kind: PayloadKind::Mailbox { recipient },
            owner,
            data,
            created_at_ms: now_ms(),
            ttl_ms: MAILBOX_TTL.as_millis() as u64,
        }
    }

    /// Content hash under which this payload is stored.
    pub fn key(&self) -> Key {
        let bytes = bincode::serialize(self).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    /// Whether the declared expiry has passed. An expired entry is logically
    /// dead even before the prune pass evicts it.
    pub fn is_expired(&self) -> bool {
        now_ms() >= self.created_at_ms.saturating_add(self.ttl_ms)
    }

    /// Self-validation predicate: structural sanity independent of any
    /// stored state.
    pub fn is_valid(&self) -> bool {
        if self.data.is_empty() || self.data.len() > MAX_PAYLOAD_SIZE {
            return false;
        }
        if self.ttl_ms == 0 || self.ttl_ms > self.kind.max_ttl().as_millis() as u64 {
            return false;
        }
        if !self.owner.is_valid() {
            return false;
        }
        if let PayloadKind::Mailbox { recipient } = &self.kind {
            if !recipient.is_valid() {
                return false;
            }
        }
        true
    }

    /// Key whose signature authorizes removing this entry: the recipient
    /// for mailbox entries (the receiver proves ownership), the publisher
    /// otherwise.
    pub fn remover(&self) -> Identity {
        match &self.kind {
            PayloadKind::Broadcast => self.owner,
            PayloadKind::Mailbox { recipient } => *recipient,
        }
    }
}

fn signable(key: &Key, sequence: SequenceNumber) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(40);
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes
}

/// Request to add or republish an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub payload: StorePayload,
    pub sequence: SequenceNumber,
    pub created_at_ms: u64,
    /// Declared publisher key; must match the payload owner.
    pub public_key: Identity,
    /// Signature over `(key || sequence)`, binding the payload content
    /// (through its hash) and the arbitration counter.
    pub signature: Vec<u8>,
}

impl AddRequest {
    /// Build and sign an add request with the publisher's keypair.
    pub fn sign(payload: StorePayload, sequence: SequenceNumber, keypair: &Keypair) -> Self {
        let key = payload.key();
        let signature = sign_with_domain(keypair, ENTRY_SIGNATURE_DOMAIN, &signable(&key, sequence));
        Self {
            payload,
            sequence,
            created_at_ms: now_ms(),
            public_key: keypair.identity(),
            signature,
        }
    }

    pub fn key(&self) -> Key {
        self.payload.key()
    }

    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.public_key,
            ENTRY_SIGNATURE_DOMAIN,
            &signable(&self.key(), self.sequence),
            &self.signature,
        )
    }
}

/// Request to remove an entry, leaving a tombstone at its key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub key: Key,
    pub sequence: SequenceNumber,
    pub created_at_ms: u64,
    /// Key claiming removal authority; checked against the stored payload's
    /// remover.
    pub public_key: Identity,
    pub signature: Vec<u8>,
}

impl RemoveRequest {
    pub fn sign(key: Key, sequence: SequenceNumber, keypair: &Keypair) -> Self {
        let signature =
            sign_with_domain(keypair, REMOVE_SIGNATURE_DOMAIN, &signable(&key, sequence));
        Self {
            key,
            sequence,
            created_at_ms: now_ms(),
            public_key: keypair.identity(),
            signature,
        }
    }

    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.public_key,
            REMOVE_SIGNATURE_DOMAIN,
            &signable(&self.key, self.sequence),
            &self.signature,
        )
    }
}

/// What lives at a key: a live entry or the tombstone that removed one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredRecord {
    Active(AddRequest),
    Tombstone(RemoveRequest),
}

impl StoredRecord {
    pub fn key(&self) -> Key {
        match self {
            StoredRecord::Active(add) => add.key(),
            StoredRecord::Tombstone(remove) => remove.key,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        match self {
            StoredRecord::Active(add) => add.sequence,
            StoredRecord::Tombstone(remove) => remove.sequence,
        }
    }

    pub fn created_at_ms(&self) -> u64 {
        match self {
            StoredRecord::Active(add) => add.created_at_ms,
            StoredRecord::Tombstone(remove) => remove.created_at_ms,
        }
    }
}

/// Result of an add request. Rejections are expected outcomes, not faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Entry stored. `replaced` is true for a sequence-only republish of an
    /// already-known key, in which case no listener fired.
    Added { replaced: bool },
    /// Identical request already stored.
    Duplicate,
    /// Sequence does not strictly exceed the stored one, or is out of the
    /// valid range.
    SequenceInvalid,
    /// The payload's declared expiry has passed.
    Expired,
    /// The payload failed its self-validation predicate.
    DataInvalid,
    /// Declared public key does not match the payload owner.
    OwnerMismatch,
    /// Signature verification failed.
    SignatureInvalid,
}

impl AddOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AddOutcome::Added { .. })
    }
}

/// Result of a remove request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Live entry replaced by the tombstone; removed-listeners fired.
    Removed,
    /// Nothing stored for the key yet; the tombstone was stored pre-emptively
    /// so a delayed add with sequence at or below it stays dead.
    NoEntry,
    /// The key already holds a tombstone. The tombstone advanced if the
    /// sequence was valid; either way no listener fired.
    AlreadyRemoved,
    SequenceInvalid,
    /// Declared public key does not match the stored payload's remover.
    OwnerMismatch,
    SignatureInvalid,
}

/// Anti-entropy delta: records the requester is missing, plus how many
/// eligible records the byte budget forced out of this round.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    pub records: Vec<StoredRecord>,
    pub truncated: u32,
}

/// Whether `incoming` may supersede `stored` under the monotonic rule:
/// strictly greater, never wrapped.
fn sequence_supersedes(incoming: SequenceNumber, stored: SequenceNumber) -> bool {
    sequence_in_range(incoming) && incoming > stored
}

fn sequence_in_range(sequence: SequenceNumber) -> bool {
    sequence >= 1 && sequence < SequenceNumber::MAX
}

// ============================================================================
// Store State (map + arbitration, exercised directly by unit tests)
// ============================================================================

struct StoreState {
    entries: HashMap<Key, StoredRecord>,
    config: StoreConfig,
}

enum Mutation {
    /// New entry stored; added-listeners fire.
    Added(AddRequest),
    /// Live entry tombstoned; removed-listeners fire.
    Removed(RemoveRequest),
    /// State changed (republish, tombstone stored or advanced) but nothing
    /// surfaces to listeners.
    Silent,
    None,
}

impl StoreState {
    fn new(config: StoreConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    /// Rebuild from a loaded snapshot, applying the age/cap policy so a
    /// long-stopped node does not resurrect a museum of dead entries.
    fn from_snapshot(config: StoreConfig, records: Vec<StoredRecord>) -> Self {
        let mut state = Self::new(config);
        for record in records {
            state.entries.insert(record.key(), record);
        }
        state.prune();
        state
    }

    fn add(&mut self, request: AddRequest) -> (AddOutcome, Mutation) {
        let key = request.key();

        if let Some(stored) = self.entries.get(&key) {
            if let StoredRecord::Active(existing) = stored {
                if *existing == request {
                    return (AddOutcome::Duplicate, Mutation::None);
                }
            }
            if !sequence_supersedes(request.sequence, stored.sequence()) {
                return (AddOutcome::SequenceInvalid, Mutation::None);
            }
        } else if !sequence_in_range(request.sequence) {
            return (AddOutcome::SequenceInvalid, Mutation::None);
        }

        if request.payload.is_expired() {
            return (AddOutcome::Expired, Mutation::None);
        }
        if !request.payload.is_valid() {
            return (AddOutcome::DataInvalid, Mutation::None);
        }
        if request.public_key != request.payload.owner {
            return (AddOutcome::OwnerMismatch, Mutation::None);
        }
        if request.verify_signature().is_err() {
            return (AddOutcome::SignatureInvalid, Mutation::None);
        }

        let replaced = self
            .entries
            .insert(key, StoredRecord::Active(request.clone()))
            .is_some();

        // A republish only bumps the sequence of known data; surfacing it
        // again would double-deliver to listeners.
        let mutation = if replaced {
            Mutation::Silent
        } else {
            Mutation::Added(request)
        };
        (AddOutcome::Added { replaced }, mutation)
    }

    fn remove(&mut self, request: RemoveRequest) -> (RemoveOutcome, Mutation) {
        // Tombstones are stored even for unknown keys, so the signature must
        // be self-consistent before anything else.
        if request.verify_signature().is_err() {
            return (RemoveOutcome::SignatureInvalid, Mutation::None);
        }
        if !sequence_in_range(request.sequence) {
            return (RemoveOutcome::SequenceInvalid, Mutation::None);
        }

        match self.entries.get(&request.key) {
            None => {
                self.entries
                    .insert(request.key, StoredRecord::Tombstone(request));
                (RemoveOutcome::NoEntry, Mutation::Silent)
            }
            Some(StoredRecord::Tombstone(existing)) => {
                if sequence_supersedes(request.sequence, existing.sequence) {
                    self.entries
                        .insert(request.key, StoredRecord::Tombstone(request));
                    (RemoveOutcome::AlreadyRemoved, Mutation::Silent)
                } else {
                    (RemoveOutcome::AlreadyRemoved, Mutation::None)
                }
            }
            Some(StoredRecord::Active(existing)) => {
                if !sequence_supersedes(request.sequence, existing.sequence) {
                    return (RemoveOutcome::SequenceInvalid, Mutation::None);
                }
                if request.public_key != existing.payload.remover() {
                    return (RemoveOutcome::OwnerMismatch, Mutation::None);
                }
                self.entries
                    .insert(request.key, StoredRecord::Tombstone(request.clone()));
                (RemoveOutcome::Removed, Mutation::Removed(request))
            }
        }
    }

    fn inventory(&self, known: &HashMap<Key, SequenceNumber>, byte_budget: usize) -> Inventory {
        let mut eligible: Vec<&StoredRecord> = self
            .entries
            .values()
            .filter(|record| {
                if let StoredRecord::Active(add) = record {
                    if add.payload.is_expired() {
                        return false;
                    }
                }
                match known.get(&record.key()) {
                    None => true,
                    Some(their_sequence) => record.sequence() > *their_sequence,
                }
            })
            .collect();

        // Newest first: fresh data flows before history when the budget bites.
        eligible.sort_by(|a, b| b.created_at_ms().cmp(&a.created_at_ms()));

        let mut inventory = Inventory::default();
        let mut spent = 0u64;
        for record in eligible {
            let size = wire_size(record);
            if spent.saturating_add(size) > byte_budget as u64 {
                inventory.truncated += 1;
                continue;
            }
            spent = spent.saturating_add(size);
            inventory.records.push((*record).clone());
        }
        inventory
    }

    fn mailbox_entries_for(&self, recipient: &Identity) -> Vec<AddRequest> {
        self.entries
            .values()
            .filter_map(|record| match record {
                StoredRecord::Active(add) => match &add.payload.kind {
                    PayloadKind::Mailbox { recipient: r } if r == recipient => {
                        if add.payload.is_expired() {
                            None
                        } else {
                            Some(add.clone())
                        }
                    }
                    _ => None,
                },
                StoredRecord::Tombstone(_) => None,
            })
            .collect()
    }

    /// Batched prune: age out old records, evict expired payloads, then
    /// enforce the entry cap keeping the newest by creation time.
    /// Returns true if anything changed.
    fn prune(&mut self) -> bool {
        let now = now_ms();
        let max_age_ms = self.config.max_record_age.as_millis() as u64;
        let before = self.entries.len();

        self.entries.retain(|_, record| {
            if now.saturating_sub(record.created_at_ms()) >= max_age_ms {
                return false;
            }
            match record {
                StoredRecord::Active(add) => !add.payload.is_expired(),
                StoredRecord::Tombstone(_) => true,
            }
        });

        if self.entries.len() > self.config.max_entries {
            let mut by_age: Vec<(Key, u64)> = self
                .entries
                .iter()
                .map(|(key, record)| (*key, record.created_at_ms()))
                .collect();
            by_age.sort_by(|a, b| a.1.cmp(&b.1));
            let excess = self.entries.len() - self.config.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }

        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.entries.len(), "pruned store entries");
        }
        dropped > 0
    }

    fn snapshot(&self) -> Vec<StoredRecord> {
        self.entries.values().cloned().collect()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum StoreCommand {
    Add(AddRequest, oneshot::Sender<AddOutcome>),
    Remove(RemoveRequest, oneshot::Sender<RemoveOutcome>),
    Get(Key, oneshot::Sender<Option<StoredRecord>>),
    Inventory(
        HashMap<Key, SequenceNumber>,
        usize,
        oneshot::Sender<Inventory>,
    ),
    MailboxFor(Identity, oneshot::Sender<Vec<AddRequest>>),
    Summary(oneshot::Sender<Vec<(Key, SequenceNumber)>>),
    AddListener(Arc<dyn DataStoreListener>),
    RemoveListener(Arc<dyn DataStoreListener>),
    Len(oneshot::Sender<usize>),
    Quit(oneshot::Sender<()>),
}

/// Public handle to the store actor.
pub struct ReplicatedDataStore {
    cmd_tx: mpsc::Sender<StoreCommand>,
}

impl Clone for ReplicatedDataStore {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

struct StoreActor {
    state: StoreState,
    listeners: Vec<Arc<dyn DataStoreListener>>,
    snapshot_file: SnapshotFile,
    flush_gate: FlushGate,
    cmd_rx: mpsc::Receiver<StoreCommand>,
}

impl ReplicatedDataStore {
    /// Load the snapshot (if any) and spawn the store actor.
    pub async fn spawn(config: StoreConfig, snapshot_file: SnapshotFile) -> Self {
        let records: Vec<StoredRecord> = snapshot_file.load_or_default().await;
        if !records.is_empty() {
            info!(entries = records.len(), "replicated store loaded from snapshot");
        }
        let flush_gate = FlushGate::with_interval(config.flush_interval);
        let prune_interval = config.prune_interval;
        let state = StoreState::from_snapshot(config, records);

        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let actor = StoreActor {
            state,
            listeners: Vec::new(),
            snapshot_file,
            flush_gate,
            cmd_rx,
        };
        tokio::spawn(actor.run(prune_interval));

        Self { cmd_tx }
    }

    pub async fn add(&self, request: AddRequest) -> AddOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StoreCommand::Add(request, tx))
            .await
            .is_err()
        {
            return AddOutcome::SequenceInvalid;
        }
        // A closed actor can no longer accept anything.
        rx.await.unwrap_or(AddOutcome::SequenceInvalid)
    }

    pub async fn remove(&self, request: RemoveRequest) -> RemoveOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StoreCommand::Remove(request, tx))
            .await
            .is_err()
        {
            return RemoveOutcome::SequenceInvalid;
        }
        rx.await.unwrap_or(RemoveOutcome::SequenceInvalid)
    }

    pub async fn get(&self, key: Key) -> Option<StoredRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(StoreCommand::Get(key, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Compute the anti-entropy delta against a requester's
    /// `(key -> sequence)` summary, bounded by a byte budget.
    pub async fn inventory(
        &self,
        known: HashMap<Key, SequenceNumber>,
        byte_budget: usize,
    ) -> Inventory {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StoreCommand::Inventory(known, byte_budget, tx))
            .await
            .is_err()
        {
            return Inventory::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Pending mailbox entries for a recipient, delivered on connection.
    pub async fn mailbox_entries_for(&self, recipient: Identity) -> Vec<AddRequest> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StoreCommand::MailboxFor(recipient, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// The local `(key -> sequence)` summary sent with inventory requests.
    pub async fn summary(&self) -> Vec<(Key, SequenceNumber)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(StoreCommand::Summary(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn add_listener(&self, listener: Arc<dyn DataStoreListener>) {
        let _ = self.cmd_tx.send(StoreCommand::AddListener(listener)).await;
    }

    /// Deregister a listener previously added with the same `Arc`.
    pub async fn remove_listener(&self, listener: &Arc<dyn DataStoreListener>) {
        let _ = self
            .cmd_tx
            .send(StoreCommand::RemoveListener(listener.clone()))
            .await;
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(StoreCommand::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the actor, flushing any pending snapshot first.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(StoreCommand::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl StoreActor {
    async fn run(mut self, prune_interval: Duration) {
        let mut prune_tick = tokio::time::interval(prune_interval);
        prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        prune_tick.tick().await;

        // The flush gate enforces the actual spacing; the tick just polls it.
        let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(StoreCommand::Add(request, reply)) => {
                            let (outcome, mutation) = self.state.add(request);
                            self.commit(&mutation);
                            let _ = reply.send(outcome);
                            self.notify(mutation);
                        }
                        Some(StoreCommand::Remove(request, reply)) => {
                            let (outcome, mutation) = self.state.remove(request);
                            self.commit(&mutation);
                            let _ = reply.send(outcome);
                            self.notify(mutation);
                        }
                        Some(StoreCommand::Get(key, reply)) => {
                            let _ = reply.send(self.state.entries.get(&key).cloned());
                        }
                        Some(StoreCommand::Inventory(known, budget, reply)) => {
                            let _ = reply.send(self.state.inventory(&known, budget));
                        }
                        Some(StoreCommand::MailboxFor(recipient, reply)) => {
                            let _ = reply.send(self.state.mailbox_entries_for(&recipient));
                        }
                        Some(StoreCommand::Summary(reply)) => {
                            let summary = self
                                .state
                                .entries
                                .iter()
                                .map(|(key, record)| (*key, record.sequence()))
                                .collect();
                            let _ = reply.send(summary);
                        }
                        Some(StoreCommand::AddListener(listener)) => {
                            self.listeners.push(listener);
                        }
                        Some(StoreCommand::RemoveListener(listener)) => {
                            self.listeners.retain(|l| !Arc::ptr_eq(l, &listener));
                        }
                        Some(StoreCommand::Len(reply)) => {
                            let _ = reply.send(self.state.entries.len());
                        }
                        Some(StoreCommand::Quit(reply)) => {
                            if self.flush_gate.is_dirty() {
                                self.flush().await;
                            }
                            let _ = reply.send(());
                            break;
                        }
                        None => break,
                    }
                }
                _ = prune_tick.tick() => {
                    if self.state.prune() {
                        self.flush_gate.mark_dirty();
                    }
                }
                _ = flush_tick.tick() => {
                    if self.flush_gate.take_due() {
                        self.flush().await;
                    }
                }
            }
        }
        debug!("store actor stopped");
    }

    /// Commit a mutation to the persistence schedule. Listeners only run
    /// after this.
    fn commit(&mut self, mutation: &Mutation) {
        if !matches!(mutation, Mutation::None) {
            self.flush_gate.mark_dirty();
        }
    }

    fn notify(&self, mutation: Mutation) {
        match mutation {
            Mutation::Added(request) => {
                for listener in &self.listeners {
                    listener.on_added(&request);
                }
            }
            Mutation::Removed(request) => {
                for listener in &self.listeners {
                    listener.on_removed(&request);
                }
            }
            Mutation::Silent | Mutation::None => {}
        }
    }

    async fn flush(&mut self) {
        let records = self.state.snapshot();
        if let Err(e) = self.snapshot_file.write(&records).await {
            warn!(error = %e, "store snapshot write failed");
        }
    }
}
