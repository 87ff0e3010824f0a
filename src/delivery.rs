//! # Cross-Transport Delivery Tracking
//!
//! Tracks, per logical message, the best-known delivery status across every
//! transport a node may use. A message sent over several circuits at once
//! converges on one status record; evidence only ever upgrades it.
//!
//! ## Status lattice
//!
//! Direct path: `Connecting < Sent < AckReceived`. Mailbox path:
//! `TryAddToMailbox < AddedToMailbox < MailboxMsgReceived`. `Failed` is
//! terminal for attempts that never produced receipt evidence.
//!
//! Once a status reflects full receipt (`AckReceived` or
//! `MailboxMsgReceived`) it is frozen: a late failure report from one
//! transport can never overwrite a success already confirmed via another.
//! Upgrades are commutative and idempotent, so ack and mailbox-receipt
//! evidence may arrive in any order.
//!
//! ## Acknowledgement round trip
//!
//! A message flagged ack-requested prompts the recipient to answer with an
//! [`AckMessage`]. A bounded LRU of already-acknowledged ids guards against
//! duplicate delivery triggering duplicate acks.
//!
//! ## Startup sweep
//!
//! Shortly after start, one sweep force-fails every message still marked
//! in flight (`Connecting`, `Sent`, `TryAddToMailbox`): by then any
//! legitimate attempt has resolved, so what remains was lost in a prior run
//! (e.g. a process restart mid-send).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::identity::{now_ms, Identity};
use crate::messages::{AckMessage, Envelope, MessageId, NetworkMessage};
use crate::peers::Address;
use crate::persist::{FlushGate, SnapshotFile};
use crate::protocols::{KeyRing, WireTransport};

/// Best-known delivery status of a logical message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// A transport attempt is being established.
    Connecting,
    /// The message left on at least one transport.
    Sent,
    /// The recipient acknowledged direct receipt.
    AckReceived,
    /// Direct paths failed; a mailbox add is in progress.
    TryAddToMailbox,
    /// The message rests in the replicated mailbox awaiting pickup.
    AddedToMailbox,
    /// The recipient acknowledged receipt via the mailbox path.
    MailboxMsgReceived,
    /// No attempt produced receipt evidence.
    Failed,
}

impl DeliveryState {
    /// Whether this status reflects full receipt and is frozen.
    pub fn is_fully_received(self) -> bool {
        matches!(
            self,
            DeliveryState::AckReceived | DeliveryState::MailboxMsgReceived
        )
    }

    /// Whether an attempt is still unresolved; these are what the startup
    /// sweep force-fails.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            DeliveryState::Connecting | DeliveryState::Sent | DeliveryState::TryAddToMailbox
        )
    }

    fn is_mailbox_path(self) -> bool {
        matches!(
            self,
            DeliveryState::TryAddToMailbox
                | DeliveryState::AddedToMailbox
                | DeliveryState::MailboxMsgReceived
        )
    }
}

/// Tunable parameters for the tracker.
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Delay before the one-shot pending-message sweep runs.
    pub sweep_delay: Duration,
    /// Minimum spacing between snapshot writes.
    pub flush_interval: Duration,
    /// Records kept when loading the snapshot (newest win).
    pub max_tracked_messages: usize,
    /// Records older than this are dropped at snapshot load.
    pub max_record_age: Duration,
    /// Bound on the acknowledged-id duplicate guard.
    pub max_acked_ids: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sweep_delay: Duration::from_secs(30),
            flush_interval: crate::persist::MIN_FLUSH_INTERVAL,
            max_tracked_messages: 10_000,
            max_record_age: Duration::from_secs(30 * 24 * 60 * 60),
            max_acked_ids: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct StatusRecord {
    state: DeliveryState,
    updated_at_ms: u64,
}

enum DeliveryCommand {
    Record(MessageId, DeliveryState),
    AckArrived(MessageId),
    AckRequested {
        message_id: MessageId,
        recipient: Identity,
        sender: Address,
    },
    Status(MessageId, oneshot::Sender<Option<DeliveryState>>),
    Watch(MessageId, oneshot::Sender<watch::Receiver<DeliveryState>>),
    Sweep,
    Len(oneshot::Sender<usize>),
    Quit(oneshot::Sender<()>),
}

/// Public handle to the delivery-tracking actor.
pub struct DeliveryTracker {
    cmd_tx: mpsc::Sender<DeliveryCommand>,
}

impl Clone for DeliveryTracker {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

struct DeliveryActor {
    statuses: HashMap<MessageId, StatusRecord>,
    watchers: HashMap<MessageId, watch::Sender<DeliveryState>>,
    acked: LruCache<MessageId, ()>,
    keyring: Arc<dyn KeyRing>,
    transport: Arc<dyn WireTransport>,
    snapshot_file: SnapshotFile,
    flush_gate: FlushGate,
    cmd_rx: mpsc::Receiver<DeliveryCommand>,
}

impl DeliveryTracker {
    /// Load the persisted status map and spawn the actor. The pending-message
    /// sweep is scheduled `config.sweep_delay` after this call.
    pub async fn spawn(
        config: DeliveryConfig,
        keyring: Arc<dyn KeyRing>,
        transport: Arc<dyn WireTransport>,
        snapshot_file: SnapshotFile,
    ) -> Self {
        let mut records: Vec<(MessageId, StatusRecord)> = snapshot_file.load_or_default().await;

        // The status map never shrinks at runtime; the load path applies the
        // age/cap policy so it cannot grow without bound across runs.
        let now = now_ms();
        let max_age_ms = config.max_record_age.as_millis() as u64;
        records.retain(|(_, record)| now.saturating_sub(record.updated_at_ms) < max_age_ms);
        records.sort_by(|a, b| b.1.updated_at_ms.cmp(&a.1.updated_at_ms));
        records.truncate(config.max_tracked_messages);

        let statuses: HashMap<MessageId, StatusRecord> = records.into_iter().collect();
        if !statuses.is_empty() {
            info!(tracked = statuses.len(), "delivery statuses loaded from snapshot");
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let actor = DeliveryActor {
            statuses,
            watchers: HashMap::new(),
            acked: LruCache::new(
                NonZeroUsize::new(config.max_acked_ids.max(1)).expect("max_acked_ids bounded >= 1"),
            ),
            keyring,
            transport,
            snapshot_file,
            flush_gate: FlushGate::with_interval(config.flush_interval),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        let tracker = Self { cmd_tx };
        tracker.spawn_sweep(config.sweep_delay);
        tracker
    }

    fn spawn_sweep(&self, delay: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(DeliveryCommand::Sweep).await;
        });
    }

    /// Record a locally-observed status for a message. Upgrade-only: once a
    /// message is fully received the call is a no-op.
    pub async fn record(&self, message_id: MessageId, state: DeliveryState) {
        let _ = self
            .cmd_tx
            .send(DeliveryCommand::Record(message_id, state))
            .await;
    }

    /// Process an inbound acknowledgement for a message we sent.
    pub async fn ack_arrived(&self, message_id: MessageId) {
        let _ = self
            .cmd_tx
            .send(DeliveryCommand::AckArrived(message_id))
            .await;
    }

    /// Process an inbound ack-requesting message: answer the sender with an
    /// ack exactly once per message id.
    pub async fn ack_requested(&self, message_id: MessageId, recipient: Identity, sender: Address) {
        let _ = self
            .cmd_tx
            .send(DeliveryCommand::AckRequested {
                message_id,
                recipient,
                sender,
            })
            .await;
    }

    pub async fn status(&self, message_id: MessageId) -> Option<DeliveryState> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DeliveryCommand::Status(message_id, tx))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Observe a message's status as it changes. The receiver starts at the
    /// current status (or `Connecting` if none is recorded yet).
    pub async fn watch(&self, message_id: MessageId) -> Option<watch::Receiver<DeliveryState>> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DeliveryCommand::Watch(message_id, tx))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn tracked_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(DeliveryCommand::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the actor, flushing any pending snapshot first.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(DeliveryCommand::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    #[cfg(test)]
    async fn sweep_now(&self) {
        let _ = self.cmd_tx.send(DeliveryCommand::Sweep).await;
    }
}

impl DeliveryActor {
    async fn run(mut self) {
        let mut flush_tick = tokio::time::interval(Duration::from_millis(250));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(DeliveryCommand::Record(id, state)) => {
                            self.record(id, state);
                        }
                        Some(DeliveryCommand::AckArrived(id)) => {
                            self.ack_arrived(id);
                        }
                        Some(DeliveryCommand::AckRequested { message_id, recipient, sender }) => {
                            self.ack_requested(message_id, recipient, sender).await;
                        }
                        Some(DeliveryCommand::Status(id, reply)) => {
                            let _ = reply.send(self.statuses.get(&id).map(|r| r.state));
                        }
                        Some(DeliveryCommand::Watch(id, reply)) => {
                            let _ = reply.send(self.watch(id));
                        }
                        Some(DeliveryCommand::Sweep) => {
                            self.sweep();
                        }
                        Some(DeliveryCommand::Len(reply)) => {
                            let _ = reply.send(self.statuses.len());
                        }
                        Some(DeliveryCommand::Quit(reply)) => {
                            if self.flush_gate.is_dirty() {
                                self.flush().await;
                            }
                            let _ = reply.send(());
                            break;
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    if self.flush_gate.take_due() {
                        self.flush().await;
                    }
                }
            }
        }
        debug!("delivery actor stopped");
    }

    fn record(&mut self, id: MessageId, state: DeliveryState) {
        if let Some(existing) = self.statuses.get(&id) {
            if existing.state.is_fully_received() {
                debug!(
                    message = %hex::encode(&id[..8]),
                    ignored = ?state,
                    "status already reflects full receipt"
                );
                return;
            }
        }

        self.statuses.insert(
            id,
            StatusRecord {
                state,
                updated_at_ms: now_ms(),
            },
        );
        if let Some(watcher) = self.watchers.get(&id) {
            let _ = watcher.send(state);
        }
        self.flush_gate.mark_dirty();
        debug!(message = %hex::encode(&id[..8]), state = ?state, "delivery status recorded");
    }

    fn ack_arrived(&mut self, id: MessageId) {
        let prior = self.statuses.get(&id).map(|r| r.state);
        match prior {
            Some(state) if state.is_fully_received() => {}
            Some(state) if state.is_mailbox_path() => {
                self.record(id, DeliveryState::MailboxMsgReceived);
            }
            // Connecting, Sent, Failed-after-the-fact, or an ack for a send
            // this run never saw: direct receipt either way.
            _ => {
                self.record(id, DeliveryState::AckReceived);
            }
        }
    }

    async fn ack_requested(&mut self, id: MessageId, recipient: Identity, sender: Address) {
        if self.acked.contains(&id) {
            debug!(message = %hex::encode(&id[..8]), "duplicate delivery, ack already sent");
            return;
        }
        // The declared recipient must resolve to local key material;
        // otherwise the message was not for us and no ack leaks our presence.
        if self.keyring.find_keypair(&recipient).is_none() {
            debug!(message = %hex::encode(&id[..8]), "ack requested for foreign recipient");
            return;
        }

        let envelope = Envelope::new(NetworkMessage::Ack(AckMessage { message_id: id }));
        match self.transport.send(&sender, envelope).await {
            Ok(()) => {
                self.acked.put(id, ());
                debug!(message = %hex::encode(&id[..8]), to = %sender, "ack sent");
            }
            Err(e) => {
                // The sender will retransmit; the id stays unacknowledged so
                // the retry produces a fresh ack attempt.
                warn!(message = %hex::encode(&id[..8]), error = %e, "ack send failed");
            }
        }
    }

    fn watch(&mut self, id: MessageId) -> watch::Receiver<DeliveryState> {
        let current = self
            .statuses
            .get(&id)
            .map(|r| r.state)
            .unwrap_or(DeliveryState::Connecting);
        self.watchers
            .entry(id)
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    /// Force-fail everything still marked in flight. Runs once per start.
    fn sweep(&mut self) {
        let stranded: Vec<MessageId> = self
            .statuses
            .iter()
            .filter(|(_, record)| record.state.is_in_flight())
            .map(|(id, _)| *id)
            .collect();

        if stranded.is_empty() {
            return;
        }
        info!(count = stranded.len(), "failing messages stranded in flight");
        for id in stranded {
            self.record(id, DeliveryState::Failed);
        }
    }

    async fn flush(&mut self) {
        let records: Vec<(MessageId, StatusRecord)> =
            self.statuses.iter().map(|(id, r)| (*id, *r)).collect();
        if let Err(e) = self.snapshot_file.write(&records).await {
            warn!(error = %e, "delivery snapshot write failed");
        }
    }
}
