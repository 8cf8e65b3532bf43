//! # Proof-of-Work Engine
//!
//! Admission cost for `HELLO`. A joining node must present a nonce whose
//! SHA-256 digest over `str(nonce) + node_id` starts with `k_pow` hex
//! zeros. That's it — no chains, no difficulty retargeting, just a few
//! milliseconds of CPU that makes Sybil floods more expensive than free.
//!
//! The digest input is the *decimal string* rendering of the nonce
//! concatenated with the node id. Both sides must agree on this exactly,
//! so it is part of the wire contract.
//!
//! Verification is four independent checks and all of them are required:
//! the declared algorithm, the declared difficulty (exact match against
//! our own `k_pow`, not ≥ — a peer claiming a different difficulty is
//! misconfigured even if its digest is harder), the digest recomputation,
//! and the leading-zero count.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The only hash algorithm the admission puzzle speaks.
pub const POW_HASH_ALG: &str = "sha256";

/// A mined proof, carried in the `pow` field of a `HELLO` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork {
    /// The winning nonce.
    pub nonce: u64,
    /// Hash algorithm identifier; always [`POW_HASH_ALG`].
    pub hash_alg: String,
    /// Difficulty the proof was mined at (leading hex zeros).
    pub difficulty_k: u32,
    /// Hex digest of `str(nonce) + node_id`, lowercase.
    pub digest_hex: String,
}

/// Why a presented proof was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowError {
    /// `hash_alg` was not [`POW_HASH_ALG`].
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The declared difficulty does not match the verifier's `k_pow`.
    #[error("difficulty mismatch: expected {expected}, got {got}")]
    DifficultyMismatch {
        /// The verifier's configured difficulty.
        expected: u32,
        /// The difficulty declared in the proof.
        got: u32,
    },

    /// Recomputing the digest from `(nonce, sender_id)` gave a different
    /// value than the proof claims.
    #[error("digest does not match nonce and sender id")]
    DigestMismatch,

    /// The digest is genuine but does not carry enough leading zeros.
    #[error("insufficient difficulty: {zeros} leading zeros, need {required}")]
    InsufficientDifficulty {
        /// Leading hex zeros actually present.
        zeros: u32,
        /// Leading hex zeros required.
        required: u32,
    },
}

/// Hex SHA-256 of the puzzle input for a given nonce and node id.
fn puzzle_digest(nonce: u64, node_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(node_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Counts leading ASCII `'0'` characters of a hex digest.
fn leading_hex_zeros(digest_hex: &str) -> u32 {
    digest_hex.bytes().take_while(|b| *b == b'0').count() as u32
}

/// Mines a proof for `node_id` at difficulty `k`.
///
/// Iterates nonces from 0 upward and returns the first one whose digest
/// carries at least `k` leading hex zeros. `k = 0` trivially succeeds at
/// nonce 0. Expected work is `16^k` hashes, so small values (≤ 5) are the
/// practical range; this runs once at startup, not per message.
pub fn produce(node_id: &str, k: u32) -> ProofOfWork {
    let mut nonce: u64 = 0;
    loop {
        let digest_hex = puzzle_digest(nonce, node_id);
        if leading_hex_zeros(&digest_hex) >= k {
            return ProofOfWork {
                nonce,
                hash_alg: POW_HASH_ALG.to_string(),
                difficulty_k: k,
                digest_hex,
            };
        }
        nonce += 1;
    }
}

/// Verifies a proof presented by `sender_id` against our difficulty `k`.
///
/// All four checks must pass. Returns the specific failure so the HELLO
/// handler can log a precise rejection reason.
pub fn verify(pow: &ProofOfWork, sender_id: &str, k: u32) -> Result<(), PowError> {
    if pow.hash_alg != POW_HASH_ALG {
        return Err(PowError::UnsupportedAlgorithm(pow.hash_alg.clone()));
    }
    if pow.difficulty_k != k {
        return Err(PowError::DifficultyMismatch {
            expected: k,
            got: pow.difficulty_k,
        });
    }
    let expected = puzzle_digest(pow.nonce, sender_id);
    if pow.digest_hex != expected {
        return Err(PowError::DigestMismatch);
    }
    let zeros = leading_hex_zeros(&pow.digest_hex);
    if zeros < k {
        return Err(PowError::InsufficientDifficulty { zeros, required: k });
    }
    Ok(())
}
