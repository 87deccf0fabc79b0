//! Request authentication for money-moving endpoints.
//!
//! Settlement requests carry an HMAC-SHA256 of the raw body in the
//! `X-Facilitator-Auth` header, keyed by a shared secret configured at
//! startup. Comparisons are constant-time.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over the body, hex-encoded.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    alloy::hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded HMAC-SHA256 signature against the body.
///
/// An undecodable signature is compared against zeros so the hex parse
/// does not become a timing side-channel.
pub fn verify_hmac(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);

    let claimed = alloy::hex::decode(signature).unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&claimed).is_ok()
}

/// Constant-time equality that leaks neither content nor length.
///
/// Both sides are hashed to fixed-width digests first, then compared with
/// `subtle`. Used for bearer-token checks on `/metrics`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_roundtrip() {
        let sig = compute_hmac(b"secret", b"body");
        assert!(verify_hmac(b"secret", b"body", &sig));
    }

    #[test]
    fn hmac_rejects_wrong_secret() {
        let sig = compute_hmac(b"secret-a", b"body");
        assert!(!verify_hmac(b"secret-b", b"body", &sig));
    }

    #[test]
    fn hmac_rejects_tampered_body() {
        let sig = compute_hmac(b"secret", b"original");
        assert!(!verify_hmac(b"secret", b"tampered", &sig));
    }

    #[test]
    fn hmac_rejects_invalid_hex() {
        assert!(!verify_hmac(b"secret", b"body", "zz-not-hex"));
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"other"));
        assert!(!constant_time_eq(b"", b"nonempty"));
    }
}
