//! Publisher identities and domain-separated signatures.
//!
//! The overlay identifies a publisher by its Ed25519 public key: [`Identity`]
//! is that 32-byte key, [`Keypair`] the matching signing half. Key *storage*
//! and rotation live in the layer above (see [`crate::protocols::KeyRing`]);
//! this module only signs outbound records and verifies inbound ones.
//!
//! Every signed record type carries its own domain prefix. A signature minted
//! for a store entry can never be replayed as a tombstone, and vice versa.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::UNIX_EPOCH;

/// Domain prefix under which replicated store entries are signed.
pub const ENTRY_SIGNATURE_DOMAIN: &[u8] = b"veilnet-entry-v1:";

/// Domain prefix under which removal tombstones are signed.
pub const REMOVE_SIGNATURE_DOMAIN: &[u8] = b"veilnet-remove-v1:";

/// Milliseconds since the Unix epoch, the timestamp unit of every signed
/// record and peer observation.
#[inline]
pub(crate) fn now_ms() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Why an inbound signature was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    InvalidPublicKey,
    VerificationFailed,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SignatureError::Missing => "no signature present",
            SignatureError::InvalidLength => "signature is not 64 bytes",
            SignatureError::InvalidPublicKey => "signer key is not a curve point",
            SignatureError::VerificationFailed => "signature does not verify",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for SignatureError {}

/// Ed25519 signing keypair of a local publisher.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from the 32-byte seed an identity layer stores.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(seed),
        }
    }

    /// The seed to hand back to the identity layer for storage.
    pub fn seed(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The public identity this keypair signs as.
    pub fn identity(&self) -> Identity {
        Identity(self.secret.verifying_key().to_bytes())
    }

    fn raw_sign(&self, message: &[u8]) -> [u8; 64] {
        self.secret.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({:?})", self.identity())
    }
}

/// A publisher's 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether these bytes decode to a usable Ed25519 key. All-zero and
    /// all-ones patterns are rejected outright; everything else must parse
    /// as a curve point.
    pub fn is_valid(&self) -> bool {
        let trivial = self.0 == [0u8; 32] || self.0 == [0xFF; 32];
        !trivial && self.decode_key().is_ok()
    }

    fn decode_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::try_from(&self.0[..]).map_err(|_| SignatureError::InvalidPublicKey)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Eight bytes of key are plenty to tell identities apart in logs.
        write!(f, "Identity({}..)", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

fn with_domain(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(domain.len() + data.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(data);
    message
}

/// Sign `data` under a domain prefix.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.raw_sign(&with_domain(domain, data)).to_vec()
}

/// Verify a domain-prefixed signature against the claimed signer.
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let sig = match signature.len() {
        0 => return Err(SignatureError::Missing),
        64 => {
            let mut bytes = [0u8; 64];
            bytes.copy_from_slice(signature);
            Signature::from_bytes(&bytes)
        }
        _ => return Err(SignatureError::InvalidLength),
    };

    identity
        .decode_key()?
        .verify_strict(&with_domain(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_round_trip_preserves_identity() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_seed(&keypair.seed());
        assert_eq!(restored.identity(), keypair.identity());
    }

    #[test]
    fn generated_identity_is_valid_point() {
        assert!(Keypair::generate().identity().is_valid());
    }

    #[test]
    fn trivial_identities_rejected() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn domain_separated_signature_round_trip() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, ENTRY_SIGNATURE_DOMAIN, b"entry bytes");
        assert!(
            verify_with_domain(&keypair.identity(), ENTRY_SIGNATURE_DOMAIN, b"entry bytes", &sig)
                .is_ok()
        );
    }

    #[test]
    fn signature_does_not_verify_across_domains() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, ENTRY_SIGNATURE_DOMAIN, b"entry bytes");
        assert_eq!(
            verify_with_domain(&keypair.identity(), REMOVE_SIGNATURE_DOMAIN, b"entry bytes", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn signature_does_not_verify_for_other_identity() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&keypair, ENTRY_SIGNATURE_DOMAIN, b"entry bytes");
        assert_eq!(
            verify_with_domain(&other.identity(), ENTRY_SIGNATURE_DOMAIN, b"entry bytes", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_rejected() {
        let identity = Keypair::generate().identity();
        assert_eq!(
            verify_with_domain(&identity, ENTRY_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&identity, ENTRY_SIGNATURE_DOMAIN, b"x", &[0u8; 32]),
            Err(SignatureError::InvalidLength)
        );
    }
}
