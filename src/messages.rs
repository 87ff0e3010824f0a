//! # Wire Protocol Messages
//!
//! This module defines all serializable message types used on the overlay
//! wire. Messages are serialized using bincode with size limits to prevent
//! memory exhaustion.
//!
//! ## Message Groups
//!
//! | Group | Types |
//! |-----------|-------------------------------------------|
//! | Handshake | `ConnectionRequest`, `ConnectionResponse` |
//! | Discovery | `PeersRequest`, `PeersResponse` |
//! | Data | `AddData`, `RemoveData`, `InventoryRequest`, `InventoryResponse` |
//! | Messaging | `Confidential`, `Ack` |
//!
//! ## Security Limits
//!
//! - `MAX_PAYLOAD_SIZE`: maximum application payload carried by an entry
//! - `MAX_DESERIALIZE_SIZE`: maximum deserialization buffer (prevents OOM)
//! - All deserialization uses `deserialize_bounded()` with size limits
//!
//! ## Envelopes
//!
//! Every message travels inside an [`Envelope`] stamped with the protocol
//! version. The handshake responder rejects mismatched versions before any
//! payload is interpreted.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::handshake::AuthToken;
use crate::identity::Identity;
use crate::peers::{Address, Peer};
use crate::store::{AddRequest, Key, RemoveRequest, StoredRecord};

/// Wire protocol version. Bumped on incompatible message changes; the
/// handshake rejects peers speaking a different version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of an application payload carried by a replicated entry
/// or confidential message (1 MiB). Larger data should be chunked above
/// this layer.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_PAYLOAD_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Identifier of a logical point-to-point message, tracked across transports
/// by the delivery-status service.
pub type MessageId = [u8; 32];

/// Generate a random message id.
pub fn random_message_id() -> MessageId {
    let mut id = [0u8; 32];
    if getrandom::getrandom(&mut id).is_err() {
        // CSPRNG failure; fall back to a time-derived id rather than a
        // constant so ids remain unique within a process.
        let ms = crate::identity::now_ms();
        id[..8].copy_from_slice(&ms.to_le_bytes());
        id[8..16].copy_from_slice(&ms.to_be_bytes());
    }
    id
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_envelope(envelope: &Envelope) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(envelope)
}

pub fn deserialize_envelope(bytes: &[u8]) -> Result<Envelope, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialized size of a value under the wire encoding. Used by the store to
/// enforce the inventory byte budget.
pub fn wire_size<T: Serialize>(value: &T) -> u64 {
    bincode::serialized_size(value).unwrap_or(u64::MAX)
}

/// Services a node declares during the handshake. A service is only wired
/// into the node when its dependencies are also enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceFlag {
    /// Peer discovery and gossip membership.
    PeerGroup,
    /// Replicated data store participation.
    Data,
    /// Encrypted point-to-point messaging.
    Confidential,
    /// Delivery acknowledgement round trips.
    Ack,
    /// Network health reporting.
    Monitor,
}

/// What a connecting node declares about itself: where it can be reached and
/// which services it runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub address: Address,
    pub services: Vec<ServiceFlag>,
}

impl Capability {
    pub fn supports(&self, flag: ServiceFlag) -> bool {
        self.services.contains(&flag)
    }
}

/// First message of an inbound connection. Carries the authorization token
/// the responder verifies before accepting any application traffic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub capability: Capability,
    /// Connection count the requester reports for itself; the token
    /// difficulty scales with it.
    pub load: u32,
    pub token: AuthToken,
}

/// Successful handshake answer carrying the responder's own capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub capability: Capability,
    pub load: u32,
    /// Token computed over the requester's declared load and address.
    pub token: AuthToken,
}

/// Ask a peer for its known-peer report ("who do you know?").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersRequest {
    pub requester: Address,
}

/// Gossip payload answering a [`PeersRequest`]: up to 200 known peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<Peer>,
}

/// Anti-entropy probe: the requester's `(key -> sequence)` summary plus the
/// response byte budget it is willing to receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRequest {
    pub known: Vec<(Key, u64)>,
    pub byte_budget: u32,
}

/// Entries the requester is missing (unknown key, or strictly higher
/// sequence). `truncated` reports how many eligible records were dropped to
/// honor the byte budget, so the requester can schedule a follow-up round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub records: Vec<StoredRecord>,
    pub truncated: u32,
}

/// Encrypted point-to-point message. The payload is sealed to the recipient
/// key by the layer above; the overlay only routes and tracks it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialMessage {
    pub message_id: MessageId,
    pub recipient: Identity,
    /// Where the acknowledgement should be sent.
    pub sender: Address,
    pub sealed: Vec<u8>,
    /// When set, the recipient answers with an [`AckMessage`] for the id.
    pub ack_requested: bool,
}

/// Acknowledgement for a previously received confidential message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub message_id: MessageId,
}

/// All messages that can travel on the overlay wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    PeersRequest(PeersRequest),
    PeersResponse(PeersResponse),
    AddData(AddRequest),
    RemoveData(RemoveRequest),
    InventoryRequest(InventoryRequest),
    InventoryResponse(InventoryResponse),
    Confidential(ConfidentialMessage),
    Ack(AckMessage),
}

impl NetworkMessage {
    /// Short name for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::ConnectionRequest(_) => "connection_request",
            NetworkMessage::ConnectionResponse(_) => "connection_response",
            NetworkMessage::PeersRequest(_) => "peers_request",
            NetworkMessage::PeersResponse(_) => "peers_response",
            NetworkMessage::AddData(_) => "add_data",
            NetworkMessage::RemoveData(_) => "remove_data",
            NetworkMessage::InventoryRequest(_) => "inventory_request",
            NetworkMessage::InventoryResponse(_) => "inventory_response",
            NetworkMessage::Confidential(_) => "confidential",
            NetworkMessage::Ack(_) => "ack",
        }
    }
}

/// Versioned wire envelope wrapping every message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub message: NetworkMessage,
}

impl Envelope {
    pub fn new(message: NetworkMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> Address {
        Address::from("alpha.onion:9999")
    }

    fn test_capability() -> Capability {
        Capability {
            address: test_address(),
            services: vec![ServiceFlag::PeerGroup, ServiceFlag::Data],
        }
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::new(NetworkMessage::PeersRequest(PeersRequest {
            requester: test_address(),
        }));

        let bytes = serialize_envelope(&envelope).expect("serialize should succeed");
        let decoded = deserialize_envelope(&bytes).expect("deserialize should succeed");

        assert_eq!(decoded.version, PROTOCOL_VERSION);
        match decoded.message {
            NetworkMessage::PeersRequest(req) => assert_eq!(req.requester, test_address()),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_envelope(&garbage).is_err());

        let envelope = Envelope::new(NetworkMessage::Ack(AckMessage {
            message_id: [7u8; 32],
        }));
        let bytes = serialize_envelope(&envelope).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_envelope(truncated).is_err());
    }

    #[test]
    fn capability_supports() {
        let capability = test_capability();
        assert!(capability.supports(ServiceFlag::PeerGroup));
        assert!(capability.supports(ServiceFlag::Data));
        assert!(!capability.supports(ServiceFlag::Ack));
    }

    #[test]
    fn confidential_round_trip() {
        let keypair = crate::identity::Keypair::generate();
        let envelope = Envelope::new(NetworkMessage::Confidential(ConfidentialMessage {
            message_id: random_message_id(),
            recipient: keypair.identity(),
            sender: test_address(),
            sealed: b"sealed payload".to_vec(),
            ack_requested: true,
        }));

        let bytes = serialize_envelope(&envelope).unwrap();
        let decoded = deserialize_envelope(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = random_message_id();
        let b = random_message_id();
        assert_ne!(a, b);
    }

    #[test]
    fn kind_names_cover_logging() {
        let msg = NetworkMessage::Ack(AckMessage {
            message_id: [0u8; 32],
        });
        assert_eq!(msg.kind(), "ack");
    }
}
