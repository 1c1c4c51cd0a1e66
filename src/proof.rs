//! # Subscription Proof Verification
//!
//! A subscribe request must demonstrate knowledge of at least one real
//! identifier consistent with the claimed prefix. The verifier is a
//! capability: the engine holds a `dyn ProofVerifier` and never assumes a
//! particular algorithm, so stronger schemes (non-interactive zero-knowledge
//! proofs are the intended future work) slot in without touching the engine.
//!
//! The default [`KnownIdVerifier`] accepts proof bytes of the form
//! `identifier(32) || blake3(domain || identifier)(32)`: a revealed
//! identifier plus a one-way commitment binding it. Verification checks the
//! commitment, then checks the identifier against the claimed prefix bit for
//! bit. The verifier needs nothing indexed to check this.
//!
//! ## Abuse Guard
//!
//! Every implementation must reject prefixes shorter than the minimum length
//! regardless of proof validity. A short prefix is within scanning reach, so
//! a valid proof for one proves nothing worth granting.

use crate::identifier::{EventId, ID_BYTES, MIN_PREFIX_BITS, Prefix};

/// Domain separation prefix for proof commitments.
pub const PROOF_COMMITMENT_DOMAIN: &[u8] = b"flowmesh-proof-v1:";

/// Expected proof length for the default scheme: id + commitment.
const KNOWN_ID_PROOF_LEN: usize = ID_BYTES * 2;

/// Checks that a subscribe request is backed by knowledge of a real
/// identifier under the claimed prefix.
///
/// Returns `false` on malformed or insufficient proof, never an error; the
/// caller surfaces an authorization rejection.
pub trait ProofVerifier: Send + Sync {
    fn verify(&self, prefix: &Prefix, proof: &[u8]) -> bool;
}

/// Compute the commitment for an identifier under the default scheme.
fn commitment(id: &EventId) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PROOF_COMMITMENT_DOMAIN);
    hasher.update(id.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Build proof bytes for an identifier the requester knows.
///
/// Used by requesters (and tests); the verifier side is [`KnownIdVerifier`].
pub fn make_proof(id: &EventId) -> Vec<u8> {
    let mut out = Vec::with_capacity(KNOWN_ID_PROOF_LEN);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&commitment(id));
    out
}

/// Default proof scheme: a revealed identifier with a one-way commitment.
pub struct KnownIdVerifier;

impl ProofVerifier for KnownIdVerifier {
    fn verify(&self, prefix: &Prefix, proof: &[u8]) -> bool {
        // Abuse guard: short prefixes never verify, valid proof or not.
        if prefix.bit_len() < MIN_PREFIX_BITS {
            return false;
        }
        if proof.len() != KNOWN_ID_PROOF_LEN {
            return false;
        }
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&proof[..ID_BYTES]);
        let id = EventId::from_bytes(id_bytes);

        if commitment(&id) != proof[ID_BYTES..] {
            return false;
        }
        prefix.matches(&id)
    }
}
