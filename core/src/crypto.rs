//! Signing seam — the engine consumes sign/verify as a service
//!
//! Session confidentiality (Noise) lives outside the core; the only crypto
//! the mesh engine itself needs is Ed25519 over the TTL-normalized envelope
//! encoding. A node's 8-byte mesh id is derived from its signing key, so an
//! announcement can prove it speaks for the id it claims.

use crate::protocol::{NodeId, SIGNATURE_LEN};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;

/// Signs outbound envelopes.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN];
    fn public_key(&self) -> [u8; 32];
}

/// Verifies inbound envelope signatures against a claimed public key.
pub trait Verifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN], public_key: &[u8; 32])
        -> bool;
}

/// Derive a node's 8-byte mesh id from its signing public key.
pub fn node_id_from_key(public_key: &[u8; 32]) -> NodeId {
    let digest = blake3::hash(public_key);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);
    id
}

/// Ed25519 signer holding the node's signing key.
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn node_id(&self) -> NodeId {
        node_id_from_key(&self.public_key())
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

/// Stateless Ed25519 verification.
#[derive(Debug, Default, Clone)]
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
        public_key: &[u8; 32],
    ) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(signature)).is_ok()
    }
}
