//! One-time challenge issuance and submission verification.
//!
//! A challenge binds a client address to an ephemeral secret. The client
//! proves possession by signing the canonical request text with HMAC-SHA256,
//! optionally alongside a proof-of-work nonce. Challenges are single-use,
//! expire on a TTL, and repeated verification failures escalate to a
//! temporary block of the client address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::pow;

type HmacSha256 = Hmac<Sha256>;

/// Typed verification failures, terminal for the call that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// No live challenge exists for the supplied identifier
    #[error("challenge does not exist")]
    ChallengeMissing,

    /// The challenge expired before verification
    #[error("challenge has expired")]
    ChallengeExpired,

    /// The challenge was already consumed by a successful verification
    #[error("challenge already used")]
    ChallengeUsed,

    /// The challenge was issued to a different client address
    #[error("challenge does not match client address")]
    ChallengeIpMismatch,

    /// The submission timestamp is unparsable or outside the accepted skew
    #[error("timestamp invalid")]
    TimestampInvalid,

    /// The challenge requires proof-of-work but no nonce was supplied
    #[error("proof-of-work nonce missing")]
    PowMissing,

    /// The proof-of-work nonce or hash does not satisfy the difficulty
    #[error("proof-of-work invalid")]
    PowInvalid,

    /// The HMAC signature does not match the canonical signing text
    #[error("signature invalid")]
    SignatureInvalid,

    /// The client address is temporarily blocked
    #[error("client temporarily blocked")]
    ClientBlocked,
}

/// Proof-of-work parameters attached to a challenge.
#[derive(Debug, Clone)]
pub struct PowParams {
    /// Required leading zero bits in the PoW digest
    pub bits: u8,
    /// Per-challenge random salt folded into the PoW message
    pub salt: String,
}

/// The one-time token set returned to a client.
///
/// Immutable after creation. The client secret is never reused across
/// bundles.
#[derive(Debug, Clone)]
pub struct ChallengeBundle {
    /// Opaque challenge identifier
    pub challenge_id: String,
    /// Per-bundle HMAC key
    pub client_secret: String,
    /// Per-bundle nonce folded into the signing text
    pub nonce: String,
    /// Proof-of-work parameters; `None` when difficulty is zero
    pub pow: Option<PowParams>,
    /// Absolute expiry
    pub expires_at: SystemTime,
}

/// Server-side shadow of an issued bundle.
struct ChallengeRecord {
    bundle: ChallengeBundle,
    client_addr: IpAddr,
    used: bool,
    fail_count: u32,
}

struct ManagerState {
    records: HashMap<String, ChallengeRecord>,
    blocked: HashMap<IpAddr, Instant>,
}

/// A signed submission presented for verification.
pub struct SubmissionProof<'a> {
    /// Address the request arrived from
    pub client_addr: IpAddr,
    /// Identifier of the challenge being answered
    pub challenge_id: &'a str,
    /// Client-supplied epoch-seconds timestamp, as sent on the wire
    pub timestamp: &'a str,
    /// Hex HMAC-SHA256 signature over the canonical signing text
    pub signature: &'a str,
    /// Proof-of-work nonce, required when the challenge carries PoW
    pub pow_nonce: Option<&'a str>,
    /// Optional client-computed PoW digest, checked before the difficulty test
    pub pow_hash: Option<&'a str>,
    /// HTTP method of the submission
    pub method: &'a str,
    /// Request path of the submission
    pub path: &'a str,
    /// Raw request body bytes
    pub body: &'a [u8],
}

/// Issues one-time challenges and verifies signed submissions against them.
///
/// All state lives behind a single lock so the single-use check-then-act
/// sequence is atomic under concurrent verification attempts. Expired
/// records and lapsed blocks are purged opportunistically on issue;
/// verification handles its own record's expiry inline. There is no
/// background timer.
pub struct ChallengeManager {
    ttl: Duration,
    timestamp_skew: Duration,
    fail_threshold: u32,
    block_duration: Duration,
    state: Mutex<ManagerState>,
}

impl ChallengeManager {
    /// Create a manager with the given challenge TTL, accepted timestamp
    /// skew, per-challenge failure threshold, and client block duration.
    pub fn new(
        ttl: Duration,
        timestamp_skew: Duration,
        fail_threshold: u32,
        block_duration: Duration,
    ) -> Self {
        Self {
            ttl,
            timestamp_skew,
            fail_threshold,
            block_duration,
            state: Mutex::new(ManagerState {
                records: HashMap::new(),
                blocked: HashMap::new(),
            }),
        }
    }

    /// Issue a new challenge bound to `client_addr`.
    ///
    /// A `pow_bits` of zero issues a challenge without proof-of-work.
    pub fn issue(&self, client_addr: IpAddr, pow_bits: u8) -> ChallengeBundle {
        let mut state = self.state.lock();
        let now = SystemTime::now();
        Self::cleanup(&mut state, now);

        // Identifiers are 128 bits of randomness; regenerate on the
        // negligible chance of colliding with a live record rather than
        // overwriting it.
        let mut challenge_id = random_hex(16);
        while state.records.contains_key(&challenge_id) {
            challenge_id = random_hex(16);
        }

        let bundle = ChallengeBundle {
            challenge_id: challenge_id.clone(),
            client_secret: random_hex(32),
            nonce: random_hex(12),
            pow: (pow_bits > 0).then(|| PowParams {
                bits: pow_bits,
                salt: random_hex(16),
            }),
            expires_at: now + self.ttl,
        };

        state.records.insert(
            challenge_id,
            ChallengeRecord {
                bundle: bundle.clone(),
                client_addr,
                used: false,
                fail_count: 0,
            },
        );

        debug!(
            client = %client_addr,
            challenge = %bundle.challenge_id,
            pow_bits = pow_bits,
            "Issued challenge"
        );

        bundle
    }

    /// Verify a signed submission against its challenge.
    ///
    /// Checks run in a fixed order and the first failure wins: client block,
    /// record existence, used flag, expiry, address binding, timestamp,
    /// proof-of-work, signature. PoW and signature failures count toward the
    /// block threshold; the rest leave no side effect beyond deleting an
    /// expired record.
    pub fn verify_submission(&self, proof: &SubmissionProof<'_>) -> Result<(), VerifyError> {
        let mut state = self.state.lock();
        let now = SystemTime::now();

        // Blocked clients are rejected before any record lookup so they
        // cannot probe challenge existence. Lapsed blocks fail this
        // comparison and are swept on the next issue.
        if let Some(&blocked_until) = state.blocked.get(&proof.client_addr) {
            if Instant::now() < blocked_until {
                return Err(VerifyError::ClientBlocked);
            }
        }

        let (used, expires_at, issued_to, nonce, client_secret, pow_params) = {
            let record = state
                .records
                .get(proof.challenge_id)
                .ok_or(VerifyError::ChallengeMissing)?;
            (
                record.used,
                record.bundle.expires_at,
                record.client_addr,
                record.bundle.nonce.clone(),
                record.bundle.client_secret.clone(),
                record.bundle.pow.clone(),
            )
        };

        if used {
            return Err(VerifyError::ChallengeUsed);
        }

        if expires_at <= now {
            state.records.remove(proof.challenge_id);
            return Err(VerifyError::ChallengeExpired);
        }

        if issued_to != proof.client_addr {
            return Err(VerifyError::ChallengeIpMismatch);
        }

        // The timestamp window is enforced independently of signature
        // validity: a harvested signature is useless once the window passes.
        let timestamp: i64 = proof
            .timestamp
            .parse()
            .map_err(|_| VerifyError::TimestampInvalid)?;
        let now_secs = now.duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        if (now_secs - timestamp).unsigned_abs() > self.timestamp_skew.as_secs() {
            return Err(VerifyError::TimestampInvalid);
        }

        let body_hash_hex = hex::encode(Sha256::digest(proof.body));

        if let Some(pow_params) = &pow_params {
            let pow_nonce = match proof.pow_nonce.map(str::trim).filter(|n| !n.is_empty()) {
                Some(nonce) => nonce,
                None => {
                    self.register_failure(&mut state, proof.challenge_id, proof.client_addr);
                    return Err(VerifyError::PowMissing);
                }
            };

            let message = pow::build_message(
                proof.method,
                proof.path,
                proof.timestamp,
                &body_hash_hex,
                proof.challenge_id,
                &pow_params.salt,
                pow_nonce,
            );
            let digest = pow::digest(&message);

            // Cheap pre-check when the client sends its own digest.
            if let Some(supplied) = proof.pow_hash.map(str::trim).filter(|h| !h.is_empty()) {
                if !hex_eq_ci(supplied, &hex::encode(digest)) {
                    self.register_failure(&mut state, proof.challenge_id, proof.client_addr);
                    return Err(VerifyError::PowInvalid);
                }
            }

            if !pow::has_leading_zero_bits(&digest, pow_params.bits) {
                self.register_failure(&mut state, proof.challenge_id, proof.client_addr);
                return Err(VerifyError::PowInvalid);
            }
        }

        let signing_text = format!(
            "{}\n{}\n{}\n{}\n{}",
            proof.method.to_uppercase(),
            proof.path,
            proof.timestamp,
            body_hash_hex,
            nonce
        );
        let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(signing_text.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if !hex_eq_ci(proof.signature, &expected) {
            self.register_failure(&mut state, proof.challenge_id, proof.client_addr);
            return Err(VerifyError::SignatureInvalid);
        }

        // Keep the used record as a tombstone until its TTL sweeps it, so a
        // replay of a consumed challenge is reported as used rather than
        // missing.
        if let Some(record) = state.records.get_mut(proof.challenge_id) {
            record.used = true;
        }

        debug!(
            client = %proof.client_addr,
            challenge = %proof.challenge_id,
            "Challenge verified"
        );

        Ok(())
    }

    /// Record a verification failure on a challenge record, escalating to a
    /// client block once the record's counter reaches the threshold.
    fn register_failure(&self, state: &mut ManagerState, challenge_id: &str, client_addr: IpAddr) {
        let threshold_reached = match state.records.get_mut(challenge_id) {
            Some(record) => {
                record.fail_count += 1;
                record.fail_count >= self.fail_threshold
            }
            None => false,
        };

        if threshold_reached {
            state.records.remove(challenge_id);
            state
                .blocked
                .insert(client_addr, Instant::now() + self.block_duration);
            warn!(
                client = %client_addr,
                block_duration = ?self.block_duration,
                "Failure threshold reached, client blocked"
            );
        }
    }

    fn cleanup(state: &mut ManagerState, now: SystemTime) {
        state.records.retain(|_, record| now < record.bundle.expires_at);
        let now_instant = Instant::now();
        state.blocked.retain(|_, until| now_instant < *until);
    }

    /// Number of live challenge records, for tests and introspection.
    pub fn live_challenges(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Number of currently blocked client addresses.
    pub fn blocked_clients(&self) -> usize {
        self.state.lock().blocked.len()
    }
}

/// Case-insensitive, constant-time comparison of two hex strings.
fn hex_eq_ci(supplied: &str, expected: &str) -> bool {
    constant_time_eq(
        supplied.to_lowercase().as_bytes(),
        expected.to_lowercase().as_bytes(),
    )
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHOD: &str = "POST";
    const PATH: &str = "/v1/feedback/issues";
    const BODY: &[u8] = br#"{"title":"hello"}"#;

    fn manager() -> ChallengeManager {
        ChallengeManager::new(
            Duration::from_secs(120),
            Duration::from_secs(90),
            5,
            Duration::from_secs(600),
        )
    }

    fn client() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn now_timestamp() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .to_string()
    }

    fn sign(bundle: &ChallengeBundle, timestamp: &str, body: &[u8]) -> String {
        let body_hash_hex = hex::encode(Sha256::digest(body));
        let signing_text = format!(
            "{}\n{}\n{}\n{}\n{}",
            METHOD, PATH, timestamp, body_hash_hex, bundle.nonce
        );
        let mut mac = HmacSha256::new_from_slice(bundle.client_secret.as_bytes()).unwrap();
        mac.update(signing_text.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn proof<'a>(
        bundle: &'a ChallengeBundle,
        timestamp: &'a str,
        signature: &'a str,
    ) -> SubmissionProof<'a> {
        SubmissionProof {
            client_addr: client(),
            challenge_id: &bundle.challenge_id,
            timestamp,
            signature,
            pow_nonce: None,
            pow_hash: None,
            method: METHOD,
            path: PATH,
            body: BODY,
        }
    }

    #[test]
    fn valid_submission_succeeds() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
            Ok(())
        );
    }

    #[test]
    fn replay_of_consumed_challenge_is_reported_used() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        manager
            .verify_submission(&proof(&bundle, &timestamp, &signature))
            .unwrap();

        // Same challenge, even with a perfectly valid signature.
        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
            Err(VerifyError::ChallengeUsed)
        );
    }

    #[test]
    fn unknown_challenge_is_missing() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        let mut p = proof(&bundle, &timestamp, &signature);
        p.challenge_id = "ffffffffffffffffffffffffffffffff";
        assert_eq!(
            manager.verify_submission(&p),
            Err(VerifyError::ChallengeMissing)
        );
    }

    #[test]
    fn expired_challenge_is_rejected_and_deleted() {
        let manager = ChallengeManager::new(
            Duration::from_millis(10),
            Duration::from_secs(90),
            5,
            Duration::from_secs(600),
        );
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
            Err(VerifyError::ChallengeExpired)
        );
        // The lapsed record is deleted; a retry can no longer distinguish it.
        assert_eq!(manager.live_challenges(), 0);
        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
            Err(VerifyError::ChallengeMissing)
        );
    }

    #[test]
    fn address_binding_is_checked_before_timestamp_and_signature() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);

        let mut p = proof(&bundle, "not-a-timestamp", "not-a-signature");
        p.client_addr = "10.1.2.3".parse().unwrap();
        assert_eq!(
            manager.verify_submission(&p),
            Err(VerifyError::ChallengeIpMismatch)
        );
    }

    #[test]
    fn timestamp_outside_skew_is_rejected_despite_valid_signature() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let stale = (now - 91).to_string();
        let signature = sign(&bundle, &stale, BODY);
        assert_eq!(
            manager.verify_submission(&proof(&bundle, &stale, &signature)),
            Err(VerifyError::TimestampInvalid)
        );

        let fresh = (now - 89).to_string();
        let signature = sign(&bundle, &fresh, BODY);
        assert_eq!(
            manager.verify_submission(&proof(&bundle, &fresh, &signature)),
            Ok(())
        );
    }

    #[test]
    fn unparsable_timestamp_is_rejected() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let signature = sign(&bundle, "soon", BODY);

        assert_eq!(
            manager.verify_submission(&proof(&bundle, "soon", &signature)),
            Err(VerifyError::TimestampInvalid)
        );
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();

        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, "deadbeef")),
            Err(VerifyError::SignatureInvalid)
        );
    }

    #[test]
    fn signature_comparison_is_case_insensitive() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY).to_uppercase();

        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
            Ok(())
        );
    }

    #[test]
    fn failure_threshold_blocks_client_even_for_fresh_valid_challenges() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();

        for _ in 0..5 {
            assert_eq!(
                manager.verify_submission(&proof(&bundle, &timestamp, "bad")),
                Err(VerifyError::SignatureInvalid)
            );
        }
        assert_eq!(manager.blocked_clients(), 1);

        // A brand-new, correctly signed challenge is still rejected while
        // the block stands.
        let fresh = manager.issue(client(), 0);
        let signature = sign(&fresh, &timestamp, BODY);
        assert_eq!(
            manager.verify_submission(&proof(&fresh, &timestamp, &signature)),
            Err(VerifyError::ClientBlocked)
        );
    }

    #[test]
    fn blocked_client_cannot_probe_challenge_existence() {
        let manager = manager();
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();

        for _ in 0..5 {
            let _ = manager.verify_submission(&proof(&bundle, &timestamp, "bad"));
        }

        let mut p = proof(&bundle, &timestamp, "bad");
        p.challenge_id = "ffffffffffffffffffffffffffffffff";
        assert_eq!(
            manager.verify_submission(&p),
            Err(VerifyError::ClientBlocked)
        );
    }

    #[test]
    fn block_lapses_after_its_duration() {
        let manager = ChallengeManager::new(
            Duration::from_secs(120),
            Duration::from_secs(90),
            2,
            Duration::from_millis(30),
        );
        let bundle = manager.issue(client(), 0);
        let timestamp = now_timestamp();

        for _ in 0..2 {
            let _ = manager.verify_submission(&proof(&bundle, &timestamp, "bad"));
        }
        assert_eq!(manager.blocked_clients(), 1);

        std::thread::sleep(Duration::from_millis(40));

        let fresh = manager.issue(client(), 0);
        let signature = sign(&fresh, &timestamp, BODY);
        assert_eq!(
            manager.verify_submission(&proof(&fresh, &timestamp, &signature)),
            Ok(())
        );
        assert_eq!(manager.blocked_clients(), 0);
    }

    #[test]
    fn pow_challenge_requires_a_nonce() {
        let manager = manager();
        let bundle = manager.issue(client(), 8);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        assert_eq!(
            manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
            Err(VerifyError::PowMissing)
        );
    }

    #[test]
    fn pow_solution_verifies_end_to_end() {
        let manager = manager();
        let bundle = manager.issue(client(), 8);
        let pow_params = bundle.pow.as_ref().unwrap();
        let timestamp = now_timestamp();
        let body_hash_hex = hex::encode(Sha256::digest(BODY));

        let (nonce, hash) = pow::solve(
            METHOD,
            PATH,
            &timestamp,
            &body_hash_hex,
            &bundle.challenge_id,
            &pow_params.salt,
            pow_params.bits,
            200_000,
        )
        .expect("8-bit PoW solvable within the iteration cap");

        let signature = sign(&bundle, &timestamp, BODY);
        let mut p = proof(&bundle, &timestamp, &signature);
        p.pow_nonce = Some(&nonce);
        p.pow_hash = Some(&hash);
        assert_eq!(manager.verify_submission(&p), Ok(()));
    }

    #[test]
    fn pow_nonce_below_difficulty_is_invalid() {
        let manager = manager();
        // At 30 bits a fixed nonce essentially never satisfies the target.
        let bundle = manager.issue(client(), 30);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        let mut p = proof(&bundle, &timestamp, &signature);
        p.pow_nonce = Some("1");
        assert_eq!(manager.verify_submission(&p), Err(VerifyError::PowInvalid));
    }

    #[test]
    fn mismatched_pow_hash_fails_the_precheck() {
        let manager = manager();
        let bundle = manager.issue(client(), 8);
        let pow_params = bundle.pow.as_ref().unwrap();
        let timestamp = now_timestamp();
        let body_hash_hex = hex::encode(Sha256::digest(BODY));

        let (nonce, _) = pow::solve(
            METHOD,
            PATH,
            &timestamp,
            &body_hash_hex,
            &bundle.challenge_id,
            &pow_params.salt,
            pow_params.bits,
            200_000,
        )
        .unwrap();

        let signature = sign(&bundle, &timestamp, BODY);
        let mut p = proof(&bundle, &timestamp, &signature);
        p.pow_nonce = Some(&nonce);
        p.pow_hash = Some("0000000000000000000000000000000000000000000000000000000000000000");
        assert_eq!(manager.verify_submission(&p), Err(VerifyError::PowInvalid));
    }

    #[test]
    fn pow_failures_count_toward_the_block_threshold() {
        let manager = manager();
        let bundle = manager.issue(client(), 8);
        let timestamp = now_timestamp();
        let signature = sign(&bundle, &timestamp, BODY);

        for _ in 0..5 {
            assert_eq!(
                manager.verify_submission(&proof(&bundle, &timestamp, &signature)),
                Err(VerifyError::PowMissing)
            );
        }
        assert_eq!(manager.blocked_clients(), 1);
    }

    #[test]
    fn issue_purges_expired_records() {
        let manager = ChallengeManager::new(
            Duration::from_millis(10),
            Duration::from_secs(90),
            5,
            Duration::from_secs(600),
        );
        manager.issue(client(), 0);
        std::thread::sleep(Duration::from_millis(20));

        manager.issue(client(), 0);
        assert_eq!(manager.live_challenges(), 1);
    }

    #[test]
    fn pow_is_omitted_at_zero_difficulty() {
        let manager = manager();
        assert!(manager.issue(client(), 0).pow.is_none());

        let bundle = manager.issue(client(), 12);
        let pow_params = bundle.pow.unwrap();
        assert_eq!(pow_params.bits, 12);
        assert_eq!(pow_params.salt.len(), 32);
    }
}
