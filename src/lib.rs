//! # veilnet - Decentralized Overlay Data Plane
//!
//! veilnet lets anonymity-network-routed nodes discover each other, exchange
//! signed data, and reliably deliver point-to-point messages without any
//! central server. It provides:
//!
//! - **Authorized handshakes**: proof-of-work tokens gate inbound
//!   connections; difficulty scales with the peer's declared load
//! - **Gossip discovery**: seed-bootstrapped peer exchange with banning,
//!   staleness filtering, and per-round de-duplication
//! - **Replicated storage**: a content-addressed, signed, sequence-numbered
//!   store resolving concurrent updates without coordination, with a
//!   store-and-forward mailbox flavor for offline recipients
//! - **Delivery tracking**: per-message best-known status across every
//!   transport, upgraded by acknowledgement round trips
//!
//! ## Architecture
//!
//! Stateful components use the **actor pattern**: a cheap-to-clone public
//! handle talks to a private actor over an async channel; the actor owns all
//! mutable state and processes commands sequentially, so every
//! read-decide-write sequence is atomic without explicit locking.
//!
//! The anonymity transport and the identity layer stay outside this crate;
//! they plug in through the [`protocols::WireTransport`] and
//! [`protocols::KeyRing`] traits.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |-------------|---------|
//! | `node` | [`ServiceNode`] composition root and lifecycle state machine |
//! | `identity` | Ed25519 keypairs, identities, domain-separated signatures |
//! | `peers` | Addresses, peers, ban list, used-address book |
//! | `messages` | Versioned wire envelopes with bounded deserialization |
//! | `handshake` | Proof-of-work authorization and the handshake responder |
//! | `exchange` | Peer-exchange candidate selection and gossip reports |
//! | `store` | Replicated signed data store with mailbox delivery |
//! | `delivery` | Cross-transport delivery-status tracking |
//! | `persist` | Versioned snapshot persistence with batched flushing |
//! | `protocols` | Trait seams to the transport and identity layers |

pub mod delivery;
pub mod exchange;
pub mod handshake;
pub mod identity;
pub mod messages;
pub mod node;
pub mod peers;
pub mod persist;
pub mod protocols;
pub mod store;

pub use delivery::DeliveryState;
pub use identity::{Identity, Keypair};
pub use messages::{Envelope, MessageId, NetworkMessage, ServiceFlag};
pub use node::{
    BroadcastResult, InboundEvent, NodeConfig, NodeState, RemovalResult, SendOutcome, SendResult,
    ServiceNode, ShutdownReport,
};
pub use peers::{Address, NetworkId, Peer};
pub use protocols::{KeyRing, SingleKeyRing, WireTransport};
pub use store::{AddOutcome, AddRequest, RemoveOutcome, RemoveRequest, StorePayload};
