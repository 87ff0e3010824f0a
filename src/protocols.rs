//! Trait seams between the overlay core and its excluded collaborators.
//!
//! The anonymity transport and the identity/key layer are external to this
//! crate; the core consumes them through the traits defined here. Traits live
//! separately from implementations so that:
//! - components depend on seams, not concrete transports
//! - tests drive the full stack with in-process fakes
//! - no circular dependency forms between the node and its services
//!
//! | Trait | Provided by | Purpose |
//! |-----------------------|---------------------|-----------------------------------|
//! | [`WireTransport`] | anonymity layer | send envelopes, tear down circuits |
//! | [`KeyRing`] | identity layer | resolve local key material |
//! | [`DataStoreListener`] | higher-level layers | observe replicated-store mutations |
//! | [`MessageListener`] | higher-level layers | observe direct messages |
//! | [`ConfidentialListener`] | higher-level layers | observe decryptable confidential messages |

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::{Identity, Keypair};
use crate::messages::{ConfidentialMessage, Envelope, NetworkMessage};
use crate::peers::Address;
use crate::store::{AddRequest, RemoveRequest};

/// Byte-moving primitive supplied by the anonymity transport layer.
///
/// The core never opens sockets or circuits itself; it hands envelopes to
/// this trait and receives inbound traffic through the event channel passed
/// to the node at startup.
#[async_trait]
pub trait WireTransport: Send + Sync + 'static {
    /// Deliver an envelope to a peer. Resolving/establishing the underlying
    /// circuit is the transport's concern; an error means the peer was not
    /// reachable on any path.
    async fn send(&self, to: &Address, envelope: Envelope) -> Result<()>;

    /// The address remote peers can reach this node at.
    fn local_address(&self) -> Address;

    /// Tear down the transport. Called by the node after all overlay
    /// services have quit (or their shutdown window elapsed).
    async fn shutdown(&self) -> Result<()>;
}

/// Key material lookup supplied by the identity layer.
///
/// The overlay core signs and verifies records but does not manage keys.
/// `find_keypair` answers the question the ack path and mailbox delivery
/// both ask: is this recipient one of ours, and with which key?
pub trait KeyRing: Send + Sync + 'static {
    /// Resolve the local keypair for an identity, if this node owns it.
    fn find_keypair(&self, identity: &Identity) -> Option<Keypair>;

    /// The node's default signing keypair.
    fn default_keypair(&self) -> Keypair;
}

/// A key ring holding exactly one keypair. Backs tests and single-identity
/// deployments; multi-key identity layers implement [`KeyRing`] themselves.
pub struct SingleKeyRing {
    keypair: Keypair,
}

impl SingleKeyRing {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }
}

impl KeyRing for SingleKeyRing {
    fn find_keypair(&self, identity: &Identity) -> Option<Keypair> {
        if self.keypair.identity() == *identity {
            Some(self.keypair.clone())
        } else {
            None
        }
    }

    fn default_keypair(&self) -> Keypair {
        self.keypair.clone()
    }
}

/// Observer of replicated-store mutations.
///
/// Listeners are invoked only after the mutation has been committed to the
/// persistence schedule, and never for sequence-only republishes.
pub trait DataStoreListener: Send + Sync + 'static {
    fn on_added(&self, entry: &AddRequest);
    fn on_removed(&self, tombstone: &RemoveRequest);
}

/// Observer of direct (non-confidential) messages received from peers.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, from: &Address, message: &NetworkMessage);
}

/// Observer of confidential messages addressed to a locally-owned key.
pub trait ConfidentialListener: Send + Sync + 'static {
    fn on_confidential(&self, message: &ConfidentialMessage);
}
