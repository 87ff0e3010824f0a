//! # Connection Authorization
//!
//! Inbound connections are authorized before any application traffic is
//! accepted. Authorization has two pieces:
//!
//! - [`AuthToken`]: a proof-of-work token the connecting peer computes over
//!   its own address and declared connection load. Verification is O(1);
//!   generation costs CPU proportional to the declared load, which curbs
//!   spam and cheap mass-connection attacks.
//! - [`HandshakeResponder`]: validates the request envelopes in a fixed
//!   order (first failure wins, no partial side effects) and manufactures
//!   the signed response for transmission.
//!
//! Handshake failure is terminal for the connection attempt: no retry is
//! performed here, and the caller is expected to close the socket.
//!
//! ## Token construction
//!
//! `BLAKE3(domain || address || load || nonce)` must have
//! `difficulty(load)` leading zero bits, where difficulty grows
//! logarithmically with the declared load. A peer reporting many open
//! connections pays more per additional connection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::messages::{
    Capability, ConnectionRequest, ConnectionResponse, Envelope, NetworkMessage, PROTOCOL_VERSION,
};
use crate::peers::{Address, BanList};

/// Domain separation prefix for token hashing.
/// Prevents cross-protocol hash reuse.
const TOKEN_HASH_DOMAIN: &[u8] = b"veilnet-token-v1:";

/// Leading zero bits required of every token, before the load surcharge.
///
/// Production (difficulty 12): ~4096 hash attempts, well under a millisecond
/// on commodity hardware. Cheap for a single honest connection, expensive in
/// bulk once the load surcharge compounds.
///
/// Tests with the `test-pow` feature (difficulty 4): ~16 attempts, so
/// handshake-heavy tests stay fast while exercising the full verification
/// path.
#[cfg(not(any(test, feature = "test-pow")))]
pub const BASE_TOKEN_DIFFICULTY: u32 = 12;

#[cfg(any(test, feature = "test-pow"))]
pub const BASE_TOKEN_DIFFICULTY: u32 = 4;

/// Cap on the load surcharge. Base + surcharge bounds worst-case token cost
/// at ~2^20 attempts regardless of how large a load a peer declares.
const MAX_LOAD_SURCHARGE: u32 = 8;

/// Maximum nonce value before giving up (prevents infinite loops).
/// At the capped difficulty, success within this bound is virtually certain.
const TOKEN_MAX_NONCE: u64 = 1 << 36;

/// Error type for proof-of-work generation failures.
///
/// Exhausting the nonce space at these difficulties indicates a broken
/// hash source rather than bad luck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowError {
    pub nonces_tried: u64,
    pub difficulty: u32,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "token generation failed after {} nonces (difficulty={})",
            self.nonces_tried, self.difficulty
        )
    }
}

impl std::error::Error for PowError {}

/// Difficulty required for a token presented with the given declared load.
///
/// Grows with log2 of the load: each doubling of reported connections adds
/// one leading-zero bit, up to [`MAX_LOAD_SURCHARGE`].
pub fn difficulty_for_load(load: u32) -> u32 {
    let surcharge = 32 - (load.saturating_add(1)).leading_zeros() - 1;
    BASE_TOKEN_DIFFICULTY + surcharge.min(MAX_LOAD_SURCHARGE)
}

/// Proof-of-work authorization token bound to an address and declared load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthToken {
    pub nonce: u64,
}

impl AuthToken {
    /// Solve for a token over the given address and load.
    ///
    /// # Errors
    /// Returns `PowError` if no valid nonce is found within the bounded
    /// search, which indicates a defective hash source.
    pub fn solve(address: &Address, load: u32) -> Result<Self, PowError> {
        let difficulty = difficulty_for_load(load);
        for nonce in 0..TOKEN_MAX_NONCE {
            if verify_token_hash(address, load, nonce, difficulty) {
                return Ok(Self { nonce });
            }
        }
        Err(PowError {
            nonces_tried: TOKEN_MAX_NONCE,
            difficulty,
        })
    }

    /// Verify this token against an address and declared load. O(1).
    pub fn verify(&self, address: &Address, load: u32) -> bool {
        verify_token_hash(address, load, self.nonce, difficulty_for_load(load))
    }
}

fn verify_token_hash(address: &Address, load: u32, nonce: u64, difficulty: u32) -> bool {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TOKEN_HASH_DOMAIN);
    hasher.update(address.as_str().as_bytes());
    hasher.update(&load.to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    count_leading_zeros(hasher.finalize().as_bytes()) >= difficulty
}

/// Count leading zero bits in a hash.
#[inline]
fn count_leading_zeros(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

/// Why an inbound connection attempt was rejected.
///
/// The checks run in the order of these variants; the first failure wins and
/// nothing is mutated on any failure path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionRejected {
    /// Zero or more than one request envelope arrived in the handshake
    /// window.
    MalformedHandshake { envelope_count: usize },
    /// The peer speaks a different protocol version.
    VersionMismatch { theirs: u32, ours: u32 },
    /// The single envelope did not carry a connection request.
    UnexpectedMessage { kind: &'static str },
    /// The declared capability address is quarantined.
    Banned,
    /// The authorization token failed verification against the declared
    /// network-load parameters.
    Unauthorized,
}

impl std::fmt::Display for ConnectionRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionRejected::MalformedHandshake { envelope_count } => {
                write!(f, "malformed handshake: {} envelopes in window", envelope_count)
            }
            ConnectionRejected::VersionMismatch { theirs, ours } => {
                write!(f, "protocol version mismatch: theirs={} ours={}", theirs, ours)
            }
            ConnectionRejected::UnexpectedMessage { kind } => {
                write!(f, "unexpected handshake message: {}", kind)
            }
            ConnectionRejected::Banned => write!(f, "banned"),
            ConnectionRejected::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

impl std::error::Error for ConnectionRejected {}

/// Authorizes inbound connection attempts and manufactures responses.
pub struct HandshakeResponder {
    capability: Capability,
    ban_list: Arc<BanList>,
}

impl HandshakeResponder {
    pub fn new(capability: Capability, ban_list: Arc<BanList>) -> Self {
        Self {
            capability,
            ban_list,
        }
    }

    /// Validate the envelopes collected during the handshake window and
    /// build the response for transmission.
    ///
    /// `own_load` is this node's current connection count, reported back to
    /// the peer inside the response.
    ///
    /// # Errors
    /// Returns [`ConnectionRejected`] on the first failed check. The caller
    /// closes the socket; no retry happens here.
    pub fn respond(
        &self,
        envelopes: &[Envelope],
        own_load: u32,
    ) -> Result<(ConnectionRequest, Envelope), ConnectionRejected> {
        if envelopes.len() != 1 {
            return Err(ConnectionRejected::MalformedHandshake {
                envelope_count: envelopes.len(),
            });
        }
        let envelope = &envelopes[0];

        if envelope.version != PROTOCOL_VERSION {
            return Err(ConnectionRejected::VersionMismatch {
                theirs: envelope.version,
                ours: PROTOCOL_VERSION,
            });
        }

        let request = match &envelope.message {
            NetworkMessage::ConnectionRequest(request) => request.clone(),
            other => {
                return Err(ConnectionRejected::UnexpectedMessage { kind: other.kind() });
            }
        };

        if self.ban_list.is_banned(&request.capability.address) {
            debug!(peer = %request.capability.address, "handshake rejected: banned");
            return Err(ConnectionRejected::Banned);
        }

        if !request.token.verify(&request.capability.address, request.load) {
            debug!(
                peer = %request.capability.address,
                load = request.load,
                "handshake rejected: token verification failed"
            );
            return Err(ConnectionRejected::Unauthorized);
        }

        // Token over the peer's declared load and address binds the response
        // to this specific connection attempt.
        let token = AuthToken::solve(&request.capability.address, request.load)
            .map_err(|_| ConnectionRejected::Unauthorized)?;

        let response = ConnectionResponse {
            capability: self.capability.clone(),
            load: own_load,
            token,
        };

        debug!(peer = %request.capability.address, "handshake accepted");
        Ok((
            request,
            Envelope::new(NetworkMessage::ConnectionResponse(response)),
        ))
    }
}

/// Build the opening request of an outbound connection, solving the
/// authorization token for the local address and load.
pub fn build_connection_request(
    capability: Capability,
    load: u32,
) -> Result<ConnectionRequest, PowError> {
    let token = AuthToken::solve(&capability.address, load)?;
    Ok(ConnectionRequest {
        capability,
        load,
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AckMessage, ServiceFlag};
    use crate::peers::BanReason;

    fn capability(addr: &str) -> Capability {
        Capability {
            address: Address::from(addr),
            services: vec![ServiceFlag::PeerGroup, ServiceFlag::Data],
        }
    }

    fn responder() -> HandshakeResponder {
        HandshakeResponder::new(capability("self.onion:8333"), Arc::new(BanList::new()))
    }

    fn valid_request(addr: &str, load: u32) -> Envelope {
        let request = build_connection_request(capability(addr), load).expect("solve");
        Envelope::new(NetworkMessage::ConnectionRequest(request))
    }

    #[test]
    fn token_round_trip() {
        let addr = Address::from("alpha.onion:9999");
        let token = AuthToken::solve(&addr, 5).expect("solve");
        assert!(token.verify(&addr, 5));
    }

    #[test]
    fn token_is_bound_to_address_and_load() {
        let addr = Address::from("alpha.onion:9999");
        let token = AuthToken::solve(&addr, 5).expect("solve");

        assert!(!token.verify(&Address::from("beta.onion:9999"), 5));
        assert!(!token.verify(&addr, 500));
    }

    #[test]
    fn difficulty_scales_with_load() {
        assert_eq!(difficulty_for_load(0), BASE_TOKEN_DIFFICULTY);
        assert_eq!(difficulty_for_load(1), BASE_TOKEN_DIFFICULTY + 1);
        assert_eq!(difficulty_for_load(7), BASE_TOKEN_DIFFICULTY + 3);
        // Surcharge is capped regardless of declared load.
        assert_eq!(
            difficulty_for_load(u32::MAX),
            BASE_TOKEN_DIFFICULTY + MAX_LOAD_SURCHARGE
        );
    }

    #[test]
    fn empty_window_is_malformed() {
        let err = responder().respond(&[], 0).unwrap_err();
        assert_eq!(err, ConnectionRejected::MalformedHandshake { envelope_count: 0 });
    }

    #[test]
    fn double_envelope_is_malformed() {
        let envelope = valid_request("alpha.onion:9999", 0);
        let err = responder()
            .respond(&[envelope.clone(), envelope], 0)
            .unwrap_err();
        assert_eq!(err, ConnectionRejected::MalformedHandshake { envelope_count: 2 });
    }

    #[test]
    fn version_mismatch_rejected_before_payload_inspection() {
        let mut envelope = Envelope::new(NetworkMessage::Ack(AckMessage {
            message_id: [0u8; 32],
        }));
        envelope.version = PROTOCOL_VERSION + 1;

        let err = responder().respond(&[envelope], 0).unwrap_err();
        assert_eq!(
            err,
            ConnectionRejected::VersionMismatch {
                theirs: PROTOCOL_VERSION + 1,
                ours: PROTOCOL_VERSION,
            }
        );
    }

    #[test]
    fn non_request_payload_rejected() {
        let envelope = Envelope::new(NetworkMessage::Ack(AckMessage {
            message_id: [0u8; 32],
        }));
        let err = responder().respond(&[envelope], 0).unwrap_err();
        assert_eq!(err, ConnectionRejected::UnexpectedMessage { kind: "ack" });
    }

    #[test]
    fn banned_address_rejected() {
        let ban_list = Arc::new(BanList::new());
        ban_list.ban(Address::from("alpha.onion:9999"), BanReason::WrongDirection);
        let responder = HandshakeResponder::new(capability("self.onion:8333"), ban_list);

        let err = responder
            .respond(&[valid_request("alpha.onion:9999", 0)], 0)
            .unwrap_err();
        assert_eq!(err, ConnectionRejected::Banned);
    }

    #[test]
    fn bad_token_rejected() {
        let mut request = build_connection_request(capability("alpha.onion:9999"), 4).unwrap();
        // Declare a different load than the token was solved for.
        request.load = 2;
        let envelope = Envelope::new(NetworkMessage::ConnectionRequest(request));

        let err = responder().respond(&[envelope], 0).unwrap_err();
        assert_eq!(err, ConnectionRejected::Unauthorized);
    }

    #[test]
    fn successful_handshake_returns_verifying_response() {
        let responder = responder();
        let envelope = valid_request("alpha.onion:9999", 3);

        let (request, response_envelope) = responder.respond(&[envelope], 7).expect("accept");
        assert_eq!(request.capability.address, Address::from("alpha.onion:9999"));

        match response_envelope.message {
            NetworkMessage::ConnectionResponse(response) => {
                assert_eq!(response.capability.address, Address::from("self.onion:8333"));
                assert_eq!(response.load, 7);
                assert!(response
                    .token
                    .verify(&Address::from("alpha.onion:9999"), 3));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
