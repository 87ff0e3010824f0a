//! # Service Node
//!
//! [`ServiceNode`] is the composition root of the overlay: it wires the
//! handshake responder, peer-exchange strategy, replicated store, and
//! delivery tracker together over a caller-supplied transport and exposes
//! the send/receive API to higher-level collaborators.
//!
//! ## Lifecycle
//!
//! Bootstrap walks a finite-state machine with strictly increasing states:
//!
//! `New → InitializeTransport → TransportInitialized →
//! InitializeDefaultNode → DefaultNodeInitialized → InitializePeerGroup →
//! PeerGroupInitialized`
//!
//! `Stopping → Terminated` is reachable from any state. A transition whose
//! ordinal does not strictly increase (except into `Stopping`) is a
//! programmer error and panics: initialization is monotonic and never
//! re-entrant. State changes are broadcast to listeners off the calling
//! path, so a slow listener cannot stall bootstrap.
//!
//! ## Capability wiring
//!
//! Services are instantiated only when their declared dependencies are
//! enabled: the data store requires `PeerGroup` + `Data`, the delivery
//! tracker requires `Confidential` + `Ack`. Calling the API of a service
//! that was not wired is a programmer error and panics.
//!
//! ## Shutdown
//!
//! `shutdown()` drives every owned service's quit concurrently under a hard
//! timeout (10 s by default). A timeout is a completed-with-failure outcome,
//! not a hang; the transport is torn down only after the window closes.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryConfig, DeliveryState, DeliveryTracker};
use crate::exchange::{ConnectionCensus, ExchangeConfig, PeerExchangeStrategy};
use crate::handshake::{ConnectionRejected, HandshakeResponder};
use crate::messages::{
    deserialize_bounded, random_message_id, Capability, ConfidentialMessage, Envelope, MessageId,
    NetworkMessage, PeersRequest, PeersResponse, InventoryRequest, InventoryResponse, ServiceFlag,
    PROTOCOL_VERSION,
};
use crate::peers::{Address, BanList, BanReason, NetworkId, Peer, UsedAddressBook};
use crate::persist::SnapshotFile;
use crate::protocols::{
    ConfidentialListener, DataStoreListener, KeyRing, MessageListener, WireTransport,
};
use crate::store::{
    AddOutcome, AddRequest, Key, PayloadKind, RemoveOutcome, RemoveRequest, ReplicatedDataStore,
    StoreConfig, StorePayload, StoredRecord,
};

/// Bootstrap/teardown states, strictly ordered by ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    New,
    InitializeTransport,
    TransportInitialized,
    InitializeDefaultNode,
    DefaultNodeInitialized,
    InitializePeerGroup,
    PeerGroupInitialized,
    Stopping,
    Terminated,
}

impl NodeState {
    pub fn ordinal(self) -> u8 {
        match self {
            NodeState::New => 0,
            NodeState::InitializeTransport => 1,
            NodeState::TransportInitialized => 2,
            NodeState::InitializeDefaultNode => 3,
            NodeState::DefaultNodeInitialized => 4,
            NodeState::InitializePeerGroup => 5,
            NodeState::PeerGroupInitialized => 6,
            NodeState::Stopping => 7,
            NodeState::Terminated => 8,
        }
    }
}

/// Observer of node lifecycle transitions.
pub trait NodeStateListener: Send + Sync + 'static {
    fn on_state(&self, state: NodeState);
}

/// Events the transport layer feeds into the node.
pub enum InboundEvent {
    /// Envelopes collected during an inbound connection's handshake window.
    /// The node answers with the response envelope to transmit, or the
    /// rejection after which the transport closes the socket.
    Handshake {
        from: Address,
        envelopes: Vec<Envelope>,
        reply: oneshot::Sender<Result<Envelope, ConnectionRejected>>,
    },
    /// A message on an established connection.
    Message { from: Address, envelope: Envelope },
    /// A connection (either direction) completed its handshake.
    Connected { peer: Peer },
    /// A connection went away.
    Disconnected { address: Address },
}

/// How a confidential send ultimately left the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered over a live transport; awaiting acknowledgement.
    Direct,
    /// Direct paths failed; stored in the replicated mailbox.
    Mailboxed,
    /// Neither direct delivery nor the mailbox accepted the message.
    Failed,
}

/// Result of a confidential send: the tracked id plus the path taken.
#[derive(Clone, Copy, Debug)]
pub struct SendResult {
    pub message_id: MessageId,
    pub outcome: SendOutcome,
}

/// Result of publishing replicated data.
#[derive(Clone, Copy, Debug)]
pub struct BroadcastResult {
    pub key: Key,
    pub outcome: AddOutcome,
    /// Connected peers the entry was pushed to.
    pub recipients: usize,
}

/// Result of retracting replicated data.
#[derive(Clone, Copy, Debug)]
pub struct RemovalResult {
    pub outcome: RemoveOutcome,
    pub recipients: usize,
}

/// Outcome of `shutdown()`.
#[derive(Clone, Copy, Debug)]
pub struct ShutdownReport {
    /// False when the shutdown window elapsed before every service quit.
    pub completed: bool,
    pub elapsed: Duration,
}

/// Node-wide configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub capabilities: Vec<ServiceFlag>,
    pub seeds: Vec<Address>,
    /// Directory holding the per-store snapshots.
    pub data_dir: PathBuf,
    /// Hard ceiling on service shutdown.
    pub shutdown_timeout: Duration,
    /// Pause between bootstrap discovery rounds when a redo is needed.
    pub bootstrap_retry_delay: Duration,
    /// Spacing of ongoing discovery rounds.
    pub exchange_interval: Duration,
    /// Byte budget declared in outbound inventory requests.
    pub inventory_byte_budget: usize,
    pub exchange: ExchangeConfig,
    pub store: StoreConfig,
    pub delivery: DeliveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            capabilities: vec![
                ServiceFlag::PeerGroup,
                ServiceFlag::Data,
                ServiceFlag::Confidential,
                ServiceFlag::Ack,
            ],
            seeds: Vec::new(),
            data_dir: PathBuf::from("veilnet-state"),
            shutdown_timeout: Duration::from_secs(10),
            bootstrap_retry_delay: Duration::from_secs(10),
            exchange_interval: Duration::from_secs(10 * 60),
            inventory_byte_budget: 512 * 1024,
            exchange: ExchangeConfig::default(),
            store: StoreConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

pub struct ServiceNode {
    config: NodeConfig,
    transport: Arc<dyn WireTransport>,
    keyring: Arc<dyn KeyRing>,
    ban_list: Arc<BanList>,
    handshake: HandshakeResponder,
    exchange: Mutex<PeerExchangeStrategy>,
    connected: Mutex<Vec<Peer>>,
    store: Option<ReplicatedDataStore>,
    delivery: Option<DeliveryTracker>,
    peers_file: SnapshotFile,
    state: Mutex<NodeState>,
    state_listeners: Mutex<Vec<Arc<dyn NodeStateListener>>>,
    message_listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
    confidential_listeners: Mutex<Vec<Arc<dyn ConfidentialListener>>>,
    shutting_down: AtomicBool,
}

impl ServiceNode {
    /// Wire the node's services per the declared capability set, walk the
    /// bootstrap state machine, and start consuming transport events.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn WireTransport>,
        keyring: Arc<dyn KeyRing>,
        inbound: mpsc::Receiver<InboundEvent>,
    ) -> Result<Arc<Self>> {
        let local_address = transport.local_address();
        let ban_list = Arc::new(BanList::new());
        let used = Arc::new(UsedAddressBook::new());

        let capability = Capability {
            address: local_address.clone(),
            services: config.capabilities.clone(),
        };
        let handshake = HandshakeResponder::new(capability, ban_list.clone());

        let mut exchange = PeerExchangeStrategy::new(
            config.exchange.clone(),
            local_address.clone(),
            config.seeds.clone(),
            ban_list.clone(),
            used,
        );
        let peers_file = SnapshotFile::new(config.data_dir.join("peers.bin"));
        let persisted: Vec<Peer> = peers_file.load_or_default().await;
        if !persisted.is_empty() {
            info!(peers = persisted.len(), "peer pool loaded from snapshot");
        }
        exchange.load_persisted(persisted);

        let has = |flag: ServiceFlag| config.capabilities.contains(&flag);

        // Service wiring is capability-conditional: each service needs all
        // of its dependencies enabled.
        let store = if has(ServiceFlag::PeerGroup) && has(ServiceFlag::Data) {
            Some(
                ReplicatedDataStore::spawn(
                    config.store.clone(),
                    SnapshotFile::new(config.data_dir.join("store.bin")),
                )
                .await,
            )
        } else {
            None
        };

        let delivery = if has(ServiceFlag::Confidential) && has(ServiceFlag::Ack) {
            Some(
                DeliveryTracker::spawn(
                    config.delivery.clone(),
                    keyring.clone(),
                    transport.clone(),
                    SnapshotFile::new(config.data_dir.join("delivery.bin")),
                )
                .await,
            )
        } else {
            None
        };

        let peer_group = has(ServiceFlag::PeerGroup);
        let node = Arc::new(Self {
            config,
            transport,
            keyring,
            ban_list,
            handshake,
            exchange: Mutex::new(exchange),
            connected: Mutex::new(Vec::new()),
            store,
            delivery,
            peers_file,
            state: Mutex::new(NodeState::New),
            state_listeners: Mutex::new(Vec::new()),
            message_listeners: Mutex::new(Vec::new()),
            confidential_listeners: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        node.transition_to(NodeState::InitializeTransport);
        node.transition_to(NodeState::TransportInitialized);

        node.transition_to(NodeState::InitializeDefaultNode);
        tokio::spawn(Self::run_inbound(node.clone(), inbound));
        node.transition_to(NodeState::DefaultNodeInitialized);

        if peer_group {
            node.transition_to(NodeState::InitializePeerGroup);
            node.spawn_exchange_loops();
            node.transition_to(NodeState::PeerGroupInitialized);
        }

        info!(address = %node.transport.local_address(), "node started");
        Ok(node)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Advance the lifecycle state machine.
    ///
    /// # Panics
    /// Panics when the new state's ordinal is not strictly greater than the
    /// current one (entering `Stopping` is exempt): initialization must be
    /// monotonic and never re-entrant.
    fn transition_to(&self, next: NodeState) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            let current = *state;
            if next != NodeState::Stopping {
                assert!(
                    next.ordinal() > current.ordinal(),
                    "illegal node state transition {:?} -> {:?}",
                    current,
                    next
                );
            }
            *state = next;
            debug!(from = ?current, to = ?next, "node state transition");
        }

        // Fan out off the calling path so a slow listener cannot stall
        // bootstrap or teardown.
        let listeners: Vec<Arc<dyn NodeStateListener>> = self
            .state_listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();
        if !listeners.is_empty() {
            tokio::spawn(async move {
                for listener in listeners {
                    listener.on_state(next);
                }
            });
        }
    }

    /// Drive every owned service's shutdown concurrently under the
    /// configured hard timeout, persist the peer pool, then tear down the
    /// transport. Idempotent: later calls report the first call's terminal
    /// state without re-running teardown.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                completed: true,
                elapsed: Duration::ZERO,
            };
        }
        self.transition_to(NodeState::Stopping);
        let start = tokio::time::Instant::now();

        let store = self.store.clone();
        let delivery = self.delivery.clone();
        let services = async move {
            tokio::join!(
                async {
                    if let Some(store) = &store {
                        store.quit().await;
                    }
                },
                async {
                    if let Some(delivery) = &delivery {
                        delivery.quit().await;
                    }
                },
            );
        };
        let completed = await_with_deadline(services, self.config.shutdown_timeout).await;
        if !completed {
            warn!(
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "service shutdown timed out, proceeding best-effort"
            );
        }

        let peers = {
            let exchange = self.exchange.lock().expect("exchange lock poisoned");
            exchange.persistable_peers()
        };
        if let Err(e) = self.peers_file.write(&peers).await {
            warn!(error = %e, "peer pool snapshot write failed");
        }

        if let Err(e) = self.transport.shutdown().await {
            warn!(error = %e, "transport teardown failed");
        }

        self.transition_to(NodeState::Terminated);
        let elapsed = start.elapsed();
        info!(completed, elapsed_ms = elapsed.as_millis() as u64, "node shut down");
        ShutdownReport { completed, elapsed }
    }

    fn is_stopping(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Public API
    // ========================================================================

    pub fn local_address(&self) -> Address {
        self.transport.local_address()
    }

    pub fn ban_list(&self) -> &Arc<BanList> {
        &self.ban_list
    }

    pub fn connection_count(&self) -> usize {
        self.connected.lock().expect("connected lock poisoned").len()
    }

    /// Peers currently pooled from gossip reports.
    pub fn known_peer_count(&self) -> usize {
        self.exchange
            .lock()
            .expect("exchange lock poisoned")
            .reported_peer_count()
    }

    pub fn add_state_listener(&self, listener: Arc<dyn NodeStateListener>) {
        self.state_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Deregister a message listener previously added with the same `Arc`.
    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.message_listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_confidential_listener(&self, listener: Arc<dyn ConfidentialListener>) {
        self.confidential_listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    pub fn remove_confidential_listener(&self, listener: &Arc<dyn ConfidentialListener>) {
        self.confidential_listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub async fn add_data_listener(&self, listener: Arc<dyn DataStoreListener>) {
        self.data_store().add_listener(listener).await;
    }

    pub async fn remove_data_listener(&self, listener: &Arc<dyn DataStoreListener>) {
        self.data_store().remove_listener(listener).await;
    }

    fn data_store(&self) -> &ReplicatedDataStore {
        self.store
            .as_ref()
            .expect("data service requires the PEER_GROUP and DATA capabilities")
    }

    fn delivery_tracker(&self) -> &DeliveryTracker {
        self.delivery
            .as_ref()
            .expect("messaging requires the CONFIDENTIAL and ACK capabilities")
    }

    /// Send a sealed payload to a recipient: direct if the transport can
    /// reach them now, otherwise via the replicated mailbox.
    pub async fn confidential_send(&self, sealed: Vec<u8>, recipient: &NetworkId) -> SendResult {
        let delivery = self.delivery_tracker();
        let message_id = random_message_id();
        let message = ConfidentialMessage {
            message_id,
            recipient: recipient.identity,
            sender: self.local_address(),
            sealed,
            ack_requested: true,
        };

        delivery.record(message_id, DeliveryState::Connecting).await;
        let envelope = Envelope::new(NetworkMessage::Confidential(message.clone()));
        match self.transport.send(&recipient.address, envelope).await {
            Ok(()) => {
                delivery.record(message_id, DeliveryState::Sent).await;
                SendResult {
                    message_id,
                    outcome: SendOutcome::Direct,
                }
            }
            Err(e) => {
                debug!(
                    to = %recipient.address,
                    error = %e,
                    "direct send failed, trying mailbox"
                );
                delivery
                    .record(message_id, DeliveryState::TryAddToMailbox)
                    .await;
                let outcome = self.mailbox_route(&message, recipient).await;
                let state = match outcome {
                    SendOutcome::Mailboxed => DeliveryState::AddedToMailbox,
                    _ => DeliveryState::Failed,
                };
                delivery.record(message_id, state).await;
                SendResult {
                    message_id,
                    outcome,
                }
            }
        }
    }

    async fn mailbox_route(
        &self,
        message: &ConfidentialMessage,
        recipient: &NetworkId,
    ) -> SendOutcome {
        let Some(store) = &self.store else {
            return SendOutcome::Failed;
        };
        let Ok(wrapped) = bincode::serialize(message) else {
            return SendOutcome::Failed;
        };

        let keypair = self.keyring.default_keypair();
        let payload = StorePayload::mailbox(keypair.identity(), recipient.identity, wrapped);
        let request = AddRequest::sign(payload, 1, &keypair);

        if !store.add(request.clone()).await.is_accepted() {
            return SendOutcome::Failed;
        }
        let pushed = self
            .broadcast(NetworkMessage::AddData(request))
            .await;
        debug!(recipients = pushed, "mailbox entry replicated");
        SendOutcome::Mailboxed
    }

    /// Publish signed data into the replicated store and push it to every
    /// connected peer. The sequence number continues from any stored entry
    /// for the same payload.
    pub async fn publish_data(&self, data: Vec<u8>) -> BroadcastResult {
        let store = self.data_store();
        let keypair = self.keyring.default_keypair();
        let payload = StorePayload::broadcast(keypair.identity(), data);
        let key = payload.key();

        let sequence = match store.get(key).await {
            Some(record) => record.sequence().saturating_add(1),
            None => 1,
        };
        let request = AddRequest::sign(payload, sequence, &keypair);
        let outcome = store.add(request.clone()).await;

        let recipients = if outcome.is_accepted() {
            self.broadcast(NetworkMessage::AddData(request)).await
        } else {
            0
        };
        BroadcastResult {
            key,
            outcome,
            recipients,
        }
    }

    /// Retract previously published data, leaving a replicated tombstone.
    pub async fn remove_data(&self, key: Key) -> RemovalResult {
        let store = self.data_store();
        let keypair = self.keyring.default_keypair();

        let sequence = match store.get(key).await {
            Some(record) => record.sequence().saturating_add(1),
            None => 1,
        };
        let request = RemoveRequest::sign(key, sequence, &keypair);
        let outcome = store.remove(request.clone()).await;

        let recipients = if outcome == RemoveOutcome::Removed {
            self.broadcast(NetworkMessage::RemoveData(request)).await
        } else {
            0
        };
        RemovalResult {
            outcome,
            recipients,
        }
    }

    /// Observe a message's delivery status across every transport.
    pub async fn message_delivery_status(
        &self,
        message_id: MessageId,
    ) -> Option<watch::Receiver<DeliveryState>> {
        self.delivery_tracker().watch(message_id).await
    }

    /// What the replicated store holds for a key, if anything.
    pub async fn stored_entry(&self, key: Key) -> Option<StoredRecord> {
        self.data_store().get(key).await
    }

    /// Pending mailbox entries for a recipient key.
    pub async fn pending_mailbox(&self, recipient: crate::identity::Identity) -> Vec<AddRequest> {
        self.data_store().mailbox_entries_for(recipient).await
    }

    async fn broadcast(&self, message: NetworkMessage) -> usize {
        let peers: Vec<Peer> = self
            .connected
            .lock()
            .expect("connected lock poisoned")
            .clone();
        let envelope = Envelope::new(message);
        let mut delivered = 0;
        for peer in peers {
            if self
                .transport
                .send(&peer.address, envelope.clone())
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn census(&self) -> ConnectionCensus {
        ConnectionCensus {
            connected: self
                .connected
                .lock()
                .expect("connected lock poisoned")
                .clone(),
        }
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    async fn run_inbound(node: Arc<Self>, mut inbound: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            if node.is_stopping() {
                break;
            }
            match event {
                InboundEvent::Handshake {
                    from,
                    envelopes,
                    reply,
                } => {
                    let own_load = node.connection_count() as u32;
                    let result = node.handshake.respond(&envelopes, own_load);
                    match &result {
                        Ok((request, _)) => {
                            node.note_connected(Peer::new(
                                request.capability.address.clone(),
                                request.load,
                            ));
                        }
                        Err(rejected) => {
                            debug!(from = %from, reason = %rejected, "inbound connection rejected");
                        }
                    }
                    let _ = reply.send(result.map(|(_, envelope)| envelope));
                }
                InboundEvent::Message { from, envelope } => {
                    node.handle_message(from, envelope).await;
                }
                InboundEvent::Connected { peer } => {
                    node.note_connected(peer.clone());
                    node.sync_inventory_with(&peer.address).await;
                }
                InboundEvent::Disconnected { address } => {
                    let mut connected = node.connected.lock().expect("connected lock poisoned");
                    connected.retain(|p| p.address != address);
                }
            }
        }
        debug!("inbound dispatch stopped");
    }

    fn note_connected(&self, peer: Peer) {
        let mut connected = self.connected.lock().expect("connected lock poisoned");
        connected.retain(|p| p.address != peer.address);
        connected.push(peer);
    }

    /// Ask a freshly connected peer for the entries we are missing. This is
    /// also how pending mailbox entries reach a recipient that was offline.
    async fn sync_inventory_with(&self, peer: &Address) {
        let Some(store) = &self.store else { return };
        let known = store.summary().await;
        let request = InventoryRequest {
            known,
            byte_budget: self.config.inventory_byte_budget as u32,
        };
        let envelope = Envelope::new(NetworkMessage::InventoryRequest(request));
        if let Err(e) = self.transport.send(peer, envelope).await {
            debug!(peer = %peer, error = %e, "inventory request failed");
        }
    }

    async fn handle_message(&self, from: Address, envelope: Envelope) {
        if envelope.version != PROTOCOL_VERSION {
            warn!(
                from = %from,
                version = envelope.version,
                "dropping message with mismatched protocol version"
            );
            return;
        }

        let listeners: Vec<Arc<dyn MessageListener>> = self
            .message_listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();
        for listener in &listeners {
            listener.on_message(&from, &envelope.message);
        }

        match envelope.message {
            NetworkMessage::PeersRequest(request) => {
                // Census first: the exchange and connection locks are never
                // held together.
                let census = self.census();
                let peers = {
                    let exchange = self.exchange.lock().expect("exchange lock poisoned");
                    exchange.peers_to_report(&request.requester, &census)
                };
                let response = Envelope::new(NetworkMessage::PeersResponse(PeersResponse {
                    peers,
                }));
                if let Err(e) = self.transport.send(&from, response).await {
                    debug!(peer = %from, error = %e, "peer report send failed");
                }
            }
            NetworkMessage::PeersResponse(response) => {
                let mut exchange = self.exchange.lock().expect("exchange lock poisoned");
                exchange.ingest_reported_peers(response.peers, &from);
            }
            NetworkMessage::AddData(request) => {
                if let Some(store) = &self.store {
                    let outcome = store.add(request.clone()).await;
                    if outcome.is_accepted() {
                        self.pickup_mailbox_entry(&request).await;
                    } else {
                        debug!(peer = %from, outcome = ?outcome, "add request not applied");
                    }
                }
            }
            NetworkMessage::RemoveData(request) => {
                if let Some(store) = &self.store {
                    let outcome = store.remove(request).await;
                    debug!(peer = %from, outcome = ?outcome, "remove request processed");
                }
            }
            NetworkMessage::InventoryRequest(request) => {
                if let Some(store) = &self.store {
                    let known: HashMap<Key, u64> = request.known.into_iter().collect();
                    let inventory = store
                        .inventory(known, request.byte_budget as usize)
                        .await;
                    let response = Envelope::new(NetworkMessage::InventoryResponse(
                        InventoryResponse {
                            records: inventory.records,
                            truncated: inventory.truncated,
                        },
                    ));
                    if let Err(e) = self.transport.send(&from, response).await {
                        debug!(peer = %from, error = %e, "inventory response send failed");
                    }
                }
            }
            NetworkMessage::InventoryResponse(response) => {
                if let Some(store) = &self.store {
                    if response.truncated > 0 {
                        debug!(
                            peer = %from,
                            truncated = response.truncated,
                            "inventory was truncated, follow-up round needed"
                        );
                    }
                    for record in response.records {
                        match record {
                            StoredRecord::Active(request) => {
                                if store.add(request.clone()).await.is_accepted() {
                                    self.pickup_mailbox_entry(&request).await;
                                }
                            }
                            StoredRecord::Tombstone(request) => {
                                let _ = store.remove(request).await;
                            }
                        }
                    }
                }
            }
            NetworkMessage::Confidential(message) => {
                self.process_confidential(message).await;
            }
            NetworkMessage::Ack(ack) => {
                if let Some(delivery) = &self.delivery {
                    delivery.ack_arrived(ack.message_id).await;
                }
            }
            NetworkMessage::ConnectionRequest(_) | NetworkMessage::ConnectionResponse(_) => {
                // Handshake traffic outside the handshake window is a
                // protocol violation.
                warn!(peer = %from, "handshake message on established connection");
                self.ban_list
                    .ban(from, BanReason::WrongDirection);
            }
        }
    }

    /// A mailbox entry addressed to one of our keys carries a wrapped
    /// confidential message; unwrap and process it like a direct arrival.
    async fn pickup_mailbox_entry(&self, request: &AddRequest) {
        let PayloadKind::Mailbox { recipient } = &request.payload.kind else {
            return;
        };
        if self.keyring.find_keypair(recipient).is_none() {
            return;
        }
        match deserialize_bounded::<ConfidentialMessage>(&request.payload.data) {
            Ok(message) => {
                debug!(message = %hex::encode(&message.message_id[..8]), "mailbox entry picked up");
                self.process_confidential(message).await;
            }
            Err(e) => {
                warn!(error = %e, "mailbox entry for us did not decode");
            }
        }
    }

    async fn process_confidential(&self, message: ConfidentialMessage) {
        if self.keyring.find_keypair(&message.recipient).is_none() {
            debug!("confidential message for foreign recipient dropped");
            return;
        }

        let listeners: Vec<Arc<dyn ConfidentialListener>> = self
            .confidential_listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();
        for listener in &listeners {
            listener.on_confidential(&message);
        }

        if message.ack_requested {
            if let Some(delivery) = &self.delivery {
                delivery
                    .ack_requested(message.message_id, message.recipient, message.sender)
                    .await;
            }
        }
    }

    // ========================================================================
    // Discovery loops
    // ========================================================================

    fn spawn_exchange_loops(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            // Bootstrap rounds, redone while the strategy says so.
            loop {
                if node.is_stopping() {
                    return;
                }
                let census = node.census();
                let candidates = {
                    let exchange = node.exchange.lock().expect("exchange lock poisoned");
                    exchange.candidates_for_initial_exchange(&census)
                };
                let (successes, attempts) = node.run_exchange_round(candidates).await;
                let census = node.census();
                let redo = {
                    let exchange = node.exchange.lock().expect("exchange lock poisoned");
                    exchange.should_redo_initial_exchange(successes, attempts, &census)
                };
                if !redo {
                    break;
                }
                tokio::time::sleep(node.config.bootstrap_retry_delay).await;
            }

            // Ongoing rounds keep the peer group populated for the life of
            // the node.
            let mut interval = tokio::time::interval(node.config.exchange_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.is_stopping() {
                    return;
                }
                let census = node.census();
                let candidates = {
                    let exchange = node.exchange.lock().expect("exchange lock poisoned");
                    exchange.candidates_for_ongoing_exchange(&census)
                };
                node.run_exchange_round(candidates).await;
            }
        });
    }

    async fn run_exchange_round(&self, candidates: Vec<Address>) -> (usize, usize) {
        let attempts = candidates.len();
        let mut successes = 0;
        for address in candidates {
            self.exchange
                .lock()
                .expect("exchange lock poisoned")
                .mark_used(&address);
            let request = Envelope::new(NetworkMessage::PeersRequest(PeersRequest {
                requester: self.local_address(),
            }));
            match self.transport.send(&address, request).await {
                Ok(()) => successes += 1,
                Err(e) => debug!(peer = %address, error = %e, "discovery request failed"),
            }
        }
        if attempts > 0 {
            debug!(successes, attempts, "discovery round finished");
        }
        (successes, attempts)
    }
}

/// Await a future under a hard deadline; `false` means the deadline hit
/// first and the work was abandoned best-effort.
async fn await_with_deadline<F: Future<Output = ()>>(future: F, deadline: Duration) -> bool {
    tokio::time::timeout(deadline, future).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::SingleKeyRing;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NullTransport {
        address: Address,
    }

    #[async_trait]
    impl WireTransport for NullTransport {
        async fn send(&self, _to: &Address, _envelope: Envelope) -> Result<()> {
            anyhow::bail!("null transport")
        }

        fn local_address(&self) -> Address {
            self.address.clone()
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> NodeConfig {
        NodeConfig {
            data_dir: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(2),
            ..NodeConfig::default()
        }
    }

    async fn test_node(dir: &tempfile::TempDir) -> Arc<ServiceNode> {
        let (_tx, rx) = mpsc::channel(16);
        ServiceNode::start(
            test_config(dir),
            Arc::new(NullTransport {
                address: Address::from("self.onion:8333"),
            }),
            Arc::new(SingleKeyRing::new(Keypair::generate())),
            rx,
        )
        .await
        .expect("node starts")
    }

    #[tokio::test]
    async fn bootstrap_reaches_peer_group_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(&dir).await;
        assert_eq!(node.state(), NodeState::PeerGroupInitialized);
        node.shutdown().await;
    }

    #[tokio::test]
    #[should_panic(expected = "illegal node state transition")]
    async fn backwards_transition_panics() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(&dir).await;
        node.transition_to(NodeState::New);
    }

    #[tokio::test]
    async fn capability_wiring_skips_undeclared_services() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel(16);
        let config = NodeConfig {
            capabilities: vec![ServiceFlag::PeerGroup],
            ..test_config(&dir)
        };
        let node = ServiceNode::start(
            config,
            Arc::new(NullTransport {
                address: Address::from("self.onion:8333"),
            }),
            Arc::new(SingleKeyRing::new(Keypair::generate())),
            rx,
        )
        .await
        .expect("node starts");

        // Data requires PeerGroup + Data; only PeerGroup was declared.
        assert!(node.store.is_none());
        assert!(node.delivery.is_none());
        node.shutdown().await;
    }

    #[tokio::test]
    #[should_panic(expected = "PEER_GROUP and DATA")]
    async fn using_unwired_service_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = mpsc::channel(16);
        let config = NodeConfig {
            capabilities: vec![ServiceFlag::Confidential, ServiceFlag::Ack],
            ..test_config(&dir)
        };
        let node = ServiceNode::start(
            config,
            Arc::new(NullTransport {
                address: Address::from("self.onion:8333"),
            }),
            Arc::new(SingleKeyRing::new(Keypair::generate())),
            rx,
        )
        .await
        .expect("node starts");
        let _ = node.publish_data(b"data".to_vec()).await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let node = test_node(&dir).await;

        let report = node.shutdown().await;
        assert!(report.completed);
        assert_eq!(node.state(), NodeState::Terminated);

        let again = node.shutdown().await;
        assert!(again.completed);
        assert_eq!(node.state(), NodeState::Terminated);
    }

    #[tokio::test]
    async fn deadline_helper_reports_timeout_in_window() {
        let start = tokio::time::Instant::now();
        let completed =
            await_with_deadline(std::future::pending::<()>(), Duration::from_millis(100)).await;
        let elapsed = start.elapsed();

        assert!(!completed);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500), "must not overshoot");
    }

    #[tokio::test]
    async fn deadline_helper_passes_fast_completion() {
        assert!(await_with_deadline(async {}, Duration::from_millis(100)).await);
    }
}
