//! ALTCHA-style proof-of-work: the server publishes `(salt, targetHash,
//! maxNumber)` and accepts any `n'` such that
//! `SHA256(salt || decimal(n')) == targetHash`. This is the ALTCHA
//! exact-match form — the server verifies with one hash, the client must
//! search for it, so the work is asymmetric.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::ct_eq;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PowParams {
    pub salt: String,
    #[serde(rename = "targetHash")]
    pub target_hash: String,
    #[serde(rename = "maxNumber")]
    pub max_number: u64,
}

/// Maps a 1..=10 difficulty dial to an expected-work budget of roughly
/// 10^3..10^6 candidate hashes, monotonically.
pub fn max_number_for_difficulty(difficulty: u8) -> u64 {
    let clamped = difficulty.clamp(1, 10) as f64;
    let exponent = 3.0 + (clamped - 1.0) * (3.0 / 9.0);
    10f64.powf(exponent).round() as u64
}

fn digest(salt: &str, n: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(n.to_string().as_bytes());
    hasher.finalize().into()
}

/// Issues a new PoW challenge: picks a random salt and a secret `n` in
/// `[0, maxNumber)`, and publishes only `(salt, targetHash, maxNumber)`.
pub fn generate(difficulty: u8) -> PowParams {
    let mut salt_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt_bytes);
    let salt = hex::encode(salt_bytes);

    let max_number = max_number_for_difficulty(difficulty);
    let n = rand::rngs::OsRng.next_u64() % max_number.max(1);
    let target_hash = hex::encode(digest(&salt, n));

    PowParams { salt, target_hash, max_number }
}

/// Accepts `candidate` iff it is below `maxNumber` and its digest matches
/// `targetHash`, compared in constant time.
pub fn verify(params: &PowParams, candidate: u64) -> bool {
    if candidate >= params.max_number {
        return false;
    }
    let Ok(expected) = hex::decode(&params.target_hash) else {
        return false;
    };
    ct_eq(&digest(&params.salt, candidate), &expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_maps_monotonically_from_1e3_to_1e6() {
        let low = max_number_for_difficulty(1);
        let high = max_number_for_difficulty(10);
        assert_eq!(low, 1_000);
        assert_eq!(high, 1_000_000);

        let mut prev = 0;
        for d in 1..=10 {
            let current = max_number_for_difficulty(d);
            assert!(current >= prev);
            prev = current;
        }
    }

    #[test]
    fn verifier_accepts_exactly_the_matching_hash() {
        // We can't recover the server's secret `n` from public params, so
        // brute-force the small search space used by difficulty 1.
        let params = generate(1);
        let solution = (0..params.max_number).find(|&n| verify(&params, n));
        assert!(solution.is_some(), "expected at least one n to verify");
    }

    #[test]
    fn verifier_rejects_n_at_or_above_max_number() {
        let params = generate(1);
        assert!(!verify(&params, params.max_number));
        assert!(!verify(&params, params.max_number + 1));
    }

    #[test]
    fn verifier_rejects_tampered_target_hash() {
        let mut params = generate(1);
        let solution = (0..params.max_number).find(|&n| verify(&params, n)).unwrap();
        params.target_hash = hex::encode([0u8; 32]);
        assert!(!verify(&params, solution));
    }
}
