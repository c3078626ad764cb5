//! Proof-of-work message construction and difficulty checking.
//!
//! A submission's PoW digest is the SHA-256 of a newline-joined message over
//! the request method, path, timestamp, body hash, challenge identifier,
//! salt, and the client-chosen nonce. Acceptance requires the digest to carry
//! at least the challenge's difficulty in leading zero bits, MSB-first.

use sha2::{Digest, Sha256};

/// Build the canonical PoW message for a submission.
///
/// The method is upper-cased; all other inputs are taken verbatim. No
/// trailing newline.
pub fn build_message(
    method: &str,
    path: &str,
    timestamp: &str,
    body_hash_hex: &str,
    challenge_id: &str,
    salt: &str,
    nonce: &str,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}",
        method.to_uppercase(),
        path,
        timestamp,
        body_hash_hex,
        challenge_id,
        salt,
        nonce
    )
}

/// SHA-256 digest of a PoW message.
pub fn digest(message: &str) -> [u8; 32] {
    Sha256::digest(message.as_bytes()).into()
}

/// Check that `digest` starts with at least `bits` zero bits, MSB-first.
pub fn has_leading_zero_bits(digest: &[u8], bits: u8) -> bool {
    let full_bytes = (bits / 8) as usize;
    let remainder = bits % 8;

    if digest.len() < full_bytes + usize::from(remainder > 0) {
        return false;
    }

    if digest[..full_bytes].iter().any(|&b| b != 0) {
        return false;
    }

    if remainder > 0 {
        let mask = 0xFFu8 << (8 - remainder);
        if digest[full_bytes] & mask != 0 {
            return false;
        }
    }

    true
}

#[cfg(test)]
pub(crate) fn solve(
    method: &str,
    path: &str,
    timestamp: &str,
    body_hash_hex: &str,
    challenge_id: &str,
    salt: &str,
    bits: u8,
    max_iterations: u64,
) -> Option<(String, String)> {
    for i in 0..max_iterations {
        let nonce = format!("{:x}", i);
        let message = build_message(
            method,
            path,
            timestamp,
            body_hash_hex,
            challenge_id,
            salt,
            &nonce,
        );
        let digest = digest(&message);
        if has_leading_zero_bits(&digest, bits) {
            return Some((nonce, hex::encode(digest)));
        }
    }
    None
}
