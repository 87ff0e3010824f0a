//! End-to-end overlay tests over an in-process transport hub.
//!
//! The hub stands in for the anonymity transport: it routes envelopes
//! between registered addresses and fails sends to unregistered ones,
//! which is how the mailbox path gets exercised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use veilnet::handshake::build_connection_request;
use veilnet::messages::{Capability, ConfidentialMessage, PeersRequest};
use veilnet::protocols::ConfidentialListener;
use veilnet::store::StoredRecord;
use veilnet::{
    Address, DeliveryState, Envelope, InboundEvent, Keypair, NetworkId, NetworkMessage,
    NodeConfig, Peer, SendOutcome, ServiceNode, SingleKeyRing, WireTransport,
};

// ============================================================================
// In-process transport hub
// ============================================================================

#[derive(Default)]
struct Hub {
    routes: Mutex<HashMap<Address, mpsc::Sender<InboundEvent>>>,
}

impl Hub {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an address and return its transport plus the inbound event
    /// stream a node consumes.
    fn join(self: &Arc<Self>, address: &str) -> (Arc<HubTransport>, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let address = Address::from(address);
        self.routes.lock().unwrap().insert(address.clone(), tx);
        (
            Arc::new(HubTransport {
                hub: self.clone(),
                address,
            }),
            rx,
        )
    }

    fn sender_for(&self, address: &Address) -> Option<mpsc::Sender<InboundEvent>> {
        self.routes.lock().unwrap().get(address).cloned()
    }

    /// Inject a transport-level event (connection notifications, handshake
    /// windows) into a node's inbound stream.
    async fn inject(&self, to: &Address, event: InboundEvent) {
        let sender = self.sender_for(to).expect("destination registered");
        sender.send(event).await.expect("node consuming events");
    }
}

struct HubTransport {
    hub: Arc<Hub>,
    address: Address,
}

#[async_trait]
impl WireTransport for HubTransport {
    async fn send(&self, to: &Address, envelope: Envelope) -> Result<()> {
        let sender = self
            .hub
            .sender_for(to)
            .with_context(|| format!("{} is unreachable", to))?;
        sender
            .send(InboundEvent::Message {
                from: self.address.clone(),
                envelope,
            })
            .await
            .map_err(|_| anyhow::anyhow!("{} stopped receiving", to))
    }

    fn local_address(&self) -> Address {
        self.address.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        self.hub.routes.lock().unwrap().remove(&self.address);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct TestNode {
    node: Arc<ServiceNode>,
    keypair: Keypair,
    address: Address,
    _dir: tempfile::TempDir,
}

async fn spawn_node(hub: &Arc<Hub>, address: &str) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let keypair = Keypair::generate();
    let (transport, rx) = hub.join(address);
    let node = ServiceNode::start(
        NodeConfig {
            data_dir: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(2),
            ..NodeConfig::default()
        },
        transport,
        Arc::new(SingleKeyRing::new(keypair.clone())),
        rx,
    )
    .await
    .expect("node starts");
    TestNode {
        node,
        keypair,
        address: Address::from(address),
        _dir: dir,
    }
}

/// Poll a condition until it holds or the timeout elapses.
async fn eventually<F, Fut>(mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

struct CapturingListener {
    received: Mutex<Vec<ConfidentialMessage>>,
}

impl CapturingListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl ConfidentialListener for CapturingListener {
    fn on_confidential(&self, message: &ConfidentialMessage) {
        self.received.lock().unwrap().push(message.clone());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn inbound_handshake_is_authorized_and_answered() {
    let hub = Hub::new();
    let responder = spawn_node(&hub, "responder.onion:1").await;
    let requester_capability = Capability {
        address: Address::from("requester.onion:1"),
        services: NodeConfig::default().capabilities,
    };
    let request = build_connection_request(requester_capability, 3).expect("solve token");
    let envelope = Envelope::new(NetworkMessage::ConnectionRequest(request));

    let (reply_tx, reply_rx) = oneshot::channel();
    hub.inject(
        &responder.address,
        InboundEvent::Handshake {
            from: Address::from("requester.onion:1"),
            envelopes: vec![envelope],
            reply: reply_tx,
        },
    )
    .await;

    let response = reply_rx.await.expect("reply sent").expect("accepted");
    match response.message {
        NetworkMessage::ConnectionResponse(response) => {
            assert_eq!(response.capability.address, responder.address);
            assert!(response
                .token
                .verify(&Address::from("requester.onion:1"), 3));
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // The authorized peer counts toward the responder's connections.
    let responder_node = responder.node.clone();
    assert!(
        eventually(move || {
            let node = responder_node.clone();
            async move { node.connection_count() == 1 }
        })
        .await
    );
    responder.node.shutdown().await;
}

#[tokio::test]
async fn direct_confidential_send_completes_ack_round_trip() {
    let hub = Hub::new();
    let alice = spawn_node(&hub, "alice.onion:1").await;
    let bob = spawn_node(&hub, "bob.onion:1").await;

    let listener = CapturingListener::new();
    bob.node.add_confidential_listener(listener.clone());

    let result = alice
        .node
        .confidential_send(
            b"sealed bytes".to_vec(),
            &NetworkId {
                address: bob.address.clone(),
                identity: bob.keypair.identity(),
            },
        )
        .await;
    assert_eq!(result.outcome, SendOutcome::Direct);

    // Bob surfaces the message; Alice converges on AckReceived.
    let probe = listener.clone();
    assert!(
        eventually(move || {
            let listener = probe.clone();
            async move { listener.count() == 1 }
        })
        .await
    );
    let alice_node = alice.node.clone();
    let id = result.message_id;
    assert!(
        eventually(|| {
            let node = alice_node.clone();
            async move {
                match node.message_delivery_status(id).await {
                    Some(rx) => *rx.borrow() == DeliveryState::AckReceived,
                    None => false,
                }
            }
        })
        .await,
        "delivery status should reach AckReceived"
    );

    alice.node.shutdown().await;
    bob.node.shutdown().await;
}

#[tokio::test]
async fn published_data_replicates_to_connected_peers() {
    let hub = Hub::new();
    let publisher = spawn_node(&hub, "publisher.onion:1").await;
    let replica = spawn_node(&hub, "replica.onion:1").await;

    // Transport reports an established connection in both directions.
    hub.inject(
        &publisher.address,
        InboundEvent::Connected {
            peer: Peer::new(replica.address.clone(), 1),
        },
    )
    .await;
    let publisher_node = publisher.node.clone();
    assert!(
        eventually(move || {
            let node = publisher_node.clone();
            async move { node.connection_count() == 1 }
        })
        .await
    );

    let result = publisher.node.publish_data(b"replicated fact".to_vec()).await;
    assert!(result.outcome.is_accepted());
    assert_eq!(result.recipients, 1);

    let replica_node = replica.node.clone();
    let key = result.key;
    assert!(
        eventually(|| {
            let node = replica_node.clone();
            async move {
                matches!(node.stored_entry(key).await, Some(StoredRecord::Active(_)))
            }
        })
        .await,
        "entry should reach the replica"
    );

    publisher.node.shutdown().await;
    replica.node.shutdown().await;
}

#[tokio::test]
async fn retracted_data_tombstones_on_replicas() {
    let hub = Hub::new();
    let publisher = spawn_node(&hub, "publisher.onion:1").await;
    let replica = spawn_node(&hub, "replica.onion:1").await;

    hub.inject(
        &publisher.address,
        InboundEvent::Connected {
            peer: Peer::new(replica.address.clone(), 1),
        },
    )
    .await;

    let published = publisher.node.publish_data(b"retractable".to_vec()).await;
    assert!(published.outcome.is_accepted());
    let key = published.key;

    let replica_node = replica.node.clone();
    assert!(
        eventually(|| {
            let node = replica_node.clone();
            async move {
                matches!(node.stored_entry(key).await, Some(StoredRecord::Active(_)))
            }
        })
        .await
    );

    let removal = publisher.node.remove_data(key).await;
    assert_eq!(removal.outcome, veilnet::RemoveOutcome::Removed);

    // The tombstone wins on the replica too.
    let replica_node = replica.node.clone();
    assert!(
        eventually(|| {
            let node = replica_node.clone();
            async move {
                matches!(
                    node.stored_entry(key).await,
                    Some(StoredRecord::Tombstone(_))
                )
            }
        })
        .await,
        "retraction should replicate as a tombstone"
    );

    publisher.node.shutdown().await;
    replica.node.shutdown().await;
}

#[tokio::test]
async fn connecting_node_catches_up_via_inventory_sync() {
    let hub = Hub::new();
    let veteran = spawn_node(&hub, "veteran.onion:1").await;
    let newcomer = spawn_node(&hub, "newcomer.onion:1").await;

    // Data published while the newcomer was elsewhere.
    let result = veteran.node.publish_data(b"history".to_vec()).await;
    assert!(result.outcome.is_accepted());

    // On connection the newcomer sends its (empty) inventory summary.
    hub.inject(
        &newcomer.address,
        InboundEvent::Connected {
            peer: Peer::new(veteran.address.clone(), 1),
        },
    )
    .await;

    let newcomer_node = newcomer.node.clone();
    let key = result.key;
    assert!(
        eventually(|| {
            let node = newcomer_node.clone();
            async move {
                matches!(node.stored_entry(key).await, Some(StoredRecord::Active(_)))
            }
        })
        .await,
        "anti-entropy should deliver the missed entry"
    );

    veteran.node.shutdown().await;
    newcomer.node.shutdown().await;
}

#[tokio::test]
async fn offline_recipient_receives_via_mailbox() {
    let hub = Hub::new();
    let sender = spawn_node(&hub, "sender.onion:1").await;
    let relay = spawn_node(&hub, "relay.onion:1").await;

    // The sender is connected to the relay; the recipient is offline (its
    // address is not registered with the hub).
    hub.inject(
        &sender.address,
        InboundEvent::Connected {
            peer: Peer::new(relay.address.clone(), 1),
        },
    )
    .await;
    let sender_node = sender.node.clone();
    assert!(
        eventually(move || {
            let node = sender_node.clone();
            async move { node.connection_count() == 1 }
        })
        .await
    );

    let recipient_keypair = Keypair::generate();
    let result = sender
        .node
        .confidential_send(
            b"for later".to_vec(),
            &NetworkId {
                address: Address::from("offline.onion:1"),
                identity: recipient_keypair.identity(),
            },
        )
        .await;
    assert_eq!(result.outcome, SendOutcome::Mailboxed);

    // The mailbox entry replicates to the relay.
    let relay_node = relay.node.clone();
    let recipient_id = recipient_keypair.identity();
    assert!(
        eventually(|| {
            let node = relay_node.clone();
            async move { !node.pending_mailbox(recipient_id).await.is_empty() }
        })
        .await,
        "relay should hold the mailbox entry"
    );

    // The recipient comes online with its own key and syncs with the relay.
    let dir = tempfile::tempdir().unwrap();
    let (transport, rx) = hub.join("recipient.onion:1");
    let recipient = ServiceNode::start(
        NodeConfig {
            data_dir: dir.path().to_path_buf(),
            shutdown_timeout: Duration::from_secs(2),
            ..NodeConfig::default()
        },
        transport,
        Arc::new(SingleKeyRing::new(recipient_keypair)),
        rx,
    )
    .await
    .expect("recipient starts");
    let listener = CapturingListener::new();
    recipient.add_confidential_listener(listener.clone());

    hub.inject(
        &Address::from("recipient.onion:1"),
        InboundEvent::Connected {
            peer: Peer::new(relay.address.clone(), 1),
        },
    )
    .await;

    // The wrapped message surfaces, and the ack upgrades the sender's
    // status along the mailbox path.
    let probe = listener.clone();
    assert!(
        eventually(move || {
            let listener = probe.clone();
            async move { listener.count() == 1 }
        })
        .await
    );
    let sender_node = sender.node.clone();
    let id = result.message_id;
    assert!(
        eventually(|| {
            let node = sender_node.clone();
            async move {
                match node.message_delivery_status(id).await {
                    Some(rx) => *rx.borrow() == DeliveryState::MailboxMsgReceived,
                    None => false,
                }
            }
        })
        .await,
        "mailbox pickup should complete the round trip"
    );

    sender.node.shutdown().await;
    relay.node.shutdown().await;
    recipient.shutdown().await;
}

#[tokio::test]
async fn discovery_round_trips_over_the_wire() {
    let hub = Hub::new();
    let asker = spawn_node(&hub, "asker.onion:1").await;
    let oracle = spawn_node(&hub, "oracle.onion:1").await;

    // The oracle knows a third peer through an established connection.
    hub.inject(
        &oracle.address,
        InboundEvent::Connected {
            peer: Peer::new(Address::from("third.onion:1"), 2),
        },
    )
    .await;

    // Simulate a discovery round: the asker requests the oracle's report.
    hub.inject(
        &oracle.address,
        InboundEvent::Message {
            from: asker.address.clone(),
            envelope: Envelope::new(NetworkMessage::PeersRequest(PeersRequest {
                requester: asker.address.clone(),
            })),
        },
    )
    .await;

    // The asker ingests the oracle's report into its gossip pool.
    let asker_node = asker.node.clone();
    assert!(
        eventually(move || {
            let node = asker_node.clone();
            async move { node.known_peer_count() == 1 }
        })
        .await,
        "reported peer should land in the asker's pool"
    );

    asker.node.shutdown().await;
    oracle.node.shutdown().await;
}
