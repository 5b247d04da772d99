//! Handshake authentication primitives.
//!
//! The serial handshake authenticates both ends with a tag derived from a
//! pre-shared secret:
//!
//! 1. `auth_key = HKDF-SHA256(ikm=secret, salt="yunbridge-v2",
//!    info="handshake-auth", len=32)`
//! 2. `tag = HMAC-SHA256(auth_key, nonce)` truncated to 16 bytes
//!
//! Nonces are 16 bytes: 8 random bytes followed by a big-endian `u64`
//! monotonic counter. The counter provides anti-replay: an inbound nonce is
//! only accepted when its counter is strictly greater than the last accepted
//! one. Buffers holding key material are wiped with `zeroize` so the
//! optimizer cannot elide the clears.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::protocol::{HANDSHAKE_NONCE_LENGTH, HANDSHAKE_TAG_LENGTH};

type HmacSha256 = Hmac<Sha256>;

/// HKDF salt fixed by the link protocol.
pub const HKDF_SALT: &[u8] = b"yunbridge-v2";
/// HKDF info string for the handshake authentication key.
pub const HKDF_INFO_AUTH: &[u8] = b"handshake-auth";
/// Derived key length in bytes.
pub const HKDF_OUTPUT_LENGTH: usize = 32;

/// Random prefix length of a nonce.
pub const NONCE_RANDOM_BYTES: usize = 8;
/// Counter suffix length of a nonce.
pub const NONCE_COUNTER_BYTES: usize = 8;

/// Derive the handshake authentication key from the shared secret.
///
/// The returned buffer zeroes itself on drop.
pub fn derive_handshake_key(shared_secret: &[u8]) -> Zeroizing<[u8; HKDF_OUTPUT_LENGTH]> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut okm = Zeroizing::new([0u8; HKDF_OUTPUT_LENGTH]);
    hk.expand(HKDF_INFO_AUTH, okm.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Compute the truncated handshake tag for `nonce`.
pub fn compute_handshake_tag(shared_secret: &[u8], nonce: &[u8]) -> [u8; HANDSHAKE_TAG_LENGTH] {
    let key = derive_handshake_key(shared_secret);
    let mut mac = HmacSha256::new_from_slice(key.as_ref())
        .expect("HMAC accepts any key length");
    mac.update(nonce);
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; HANDSHAKE_TAG_LENGTH];
    tag.copy_from_slice(&digest[..HANDSHAKE_TAG_LENGTH]);
    tag
}

/// Constant-time verification of a truncated handshake tag.
pub fn verify_handshake_tag(shared_secret: &[u8], nonce: &[u8], tag: &[u8]) -> bool {
    if tag.len() != HANDSHAKE_TAG_LENGTH {
        return false;
    }
    let key = derive_handshake_key(shared_secret);
    let mut mac = HmacSha256::new_from_slice(key.as_ref())
        .expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.verify_truncated_left(tag).is_ok()
}

/// Generate a nonce carrying the next counter value.
///
/// Returns `(nonce, new_counter)`; the caller persists the new counter so
/// every nonce over the process lifetime is strictly increasing.
pub fn generate_nonce_with_counter(counter: u64) -> ([u8; HANDSHAKE_NONCE_LENGTH], u64) {
    let new_counter = counter + 1;
    let mut nonce = [0u8; HANDSHAKE_NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce[..NONCE_RANDOM_BYTES]);
    nonce[NONCE_RANDOM_BYTES..].copy_from_slice(&new_counter.to_be_bytes());
    (nonce, new_counter)
}

/// Extract the big-endian counter from a 16-byte nonce.
pub fn extract_nonce_counter(nonce: &[u8]) -> Option<u64> {
    if nonce.len() != HANDSHAKE_NONCE_LENGTH {
        return None;
    }
    let mut counter = [0u8; NONCE_COUNTER_BYTES];
    counter.copy_from_slice(&nonce[NONCE_RANDOM_BYTES..]);
    Some(u64::from_be_bytes(counter))
}

/// Anti-replay check: accept `nonce` only when its counter is strictly
/// greater than `last_counter`. Returns the new counter on success.
pub fn validate_nonce_counter(nonce: &[u8], last_counter: u64) -> Option<u64> {
    let current = extract_nonce_counter(nonce)?;
    if current <= last_counter {
        return None;
    }
    Some(current)
}

/// Overwrite a sensitive buffer with zeros.
pub fn secure_zero(buffer: &mut [u8]) {
    buffer.zeroize();
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"correct horse battery staple";

    #[test]
    fn derived_key_is_deterministic() {
        let a = derive_handshake_key(SECRET);
        let b = derive_handshake_key(SECRET);
        assert_eq!(a.as_ref(), b.as_ref());
        let c = derive_handshake_key(b"another secret!!");
        assert_ne!(a.as_ref(), c.as_ref());
    }

    #[test]
    fn tag_verifies_against_same_secret_and_nonce() {
        let (nonce, _) = generate_nonce_with_counter(0);
        let tag = compute_handshake_tag(SECRET, &nonce);
        assert!(verify_handshake_tag(SECRET, &nonce, &tag));
    }

    #[test]
    fn tag_rejects_wrong_secret() {
        let (nonce, _) = generate_nonce_with_counter(0);
        let tag = compute_handshake_tag(SECRET, &nonce);
        assert!(!verify_handshake_tag(b"wrong secret 123", &nonce, &tag));
    }

    #[test]
    fn tag_rejects_wrong_nonce() {
        let (nonce_a, counter) = generate_nonce_with_counter(0);
        let (nonce_b, _) = generate_nonce_with_counter(counter);
        let tag = compute_handshake_tag(SECRET, &nonce_a);
        assert!(!verify_handshake_tag(SECRET, &nonce_b, &tag));
    }

    #[test]
    fn tag_rejects_wrong_length() {
        let (nonce, _) = generate_nonce_with_counter(0);
        let tag = compute_handshake_tag(SECRET, &nonce);
        assert!(!verify_handshake_tag(SECRET, &nonce, &tag[..8]));
    }

    #[test]
    fn nonce_layout_random_then_counter() {
        let (nonce, counter) = generate_nonce_with_counter(41);
        assert_eq!(counter, 42);
        assert_eq!(nonce.len(), HANDSHAKE_NONCE_LENGTH);
        assert_eq!(extract_nonce_counter(&nonce), Some(42));
    }

    #[test]
    fn counter_increments_monotonically() {
        let mut counter = 0;
        let mut last = 0;
        for _ in 0..5 {
            let (nonce, next) = generate_nonce_with_counter(counter);
            counter = next;
            let accepted = validate_nonce_counter(&nonce, last).unwrap();
            assert!(accepted > last);
            last = accepted;
        }
    }

    #[test]
    fn replayed_nonce_rejected() {
        let (nonce, _) = generate_nonce_with_counter(7);
        let accepted = validate_nonce_counter(&nonce, 0).unwrap();
        assert_eq!(accepted, 8);
        // Same nonce again: counter no longer strictly greater.
        assert!(validate_nonce_counter(&nonce, accepted).is_none());
    }

    #[test]
    fn short_nonce_rejected() {
        assert!(extract_nonce_counter(&[0u8; 8]).is_none());
        assert!(validate_nonce_counter(&[0u8; 8], 0).is_none());
    }

    #[test]
    fn secure_zero_clears_buffer() {
        let mut buf = *b"sensitive material!!";
        secure_zero(&mut buf);
        assert_eq!(buf, [0u8; 20]);
    }
}
