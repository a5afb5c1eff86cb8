//! Query-signature verification for client downloads (spec.md §4.7a),
//! ported from `handler.go:checkQuerySign`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    MissingParam,
    Expired,
    Mismatch,
}

/// Verify `s`/`e` query parameters against `secret` and `hash`.
///
/// `e` is a base-36-encoded millisecond Unix timestamp; the signature is
/// `base64url_no_pad(SHA1(secret || hash || e))` — a plain concatenated
/// digest, not a keyed HMAC. Comparison does not need to be
/// constant-time: the coordinator-issued signature is not secret from the
/// client's point of view, only unforgeable without the secret.
pub fn check_query_sign(
    secret: &str,
    hash: &str,
    s: Option<&str>,
    e: Option<&str>,
) -> Result<(), SignatureError> {
    let (s, e) = match (s, e) {
        (Some(s), Some(e)) if !s.is_empty() && !e.is_empty() => (s, e),
        _ => return Err(SignatureError::MissingParam),
    };

    let expiry_ms = i64::from_str_radix(e, 36).map_err(|_| SignatureError::MissingParam)?;
    let now_ms = Utc::now().timestamp_millis();
    if now_ms > expiry_ms {
        return Err(SignatureError::Expired);
    }

    let digest = Sha1::new()
        .chain_update(secret.as_bytes())
        .chain_update(hash.as_bytes())
        .chain_update(e.as_bytes())
        .finalize();
    let expected = URL_SAFE_NO_PAD.encode(digest);

    if expected == s {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Encode `expiry_ms` the same way a coordinator would when minting a
/// signed URL — used only by tests to construct fixtures.
#[cfg(test)]
fn encode_base36(mut n: i64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

#[cfg(test)]
fn sign(secret: &str, hash: &str, e: &str) -> String {
    let digest = Sha1::new()
        .chain_update(secret.as_bytes())
        .chain_update(hash.as_bytes())
        .chain_update(e.as_bytes())
        .finalize();
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_signature_with_future_expiry() {
        let secret = "s3cr3t";
        let hash = "abc123";
        let e = encode_base36(Utc::now().timestamp_millis() + 60_000);
        let s = sign(secret, hash, &e);
        assert!(check_query_sign(secret, hash, Some(&s), Some(&e)).is_ok());
    }

    #[test]
    fn rejects_expired_signature() {
        let secret = "s3cr3t";
        let hash = "abc123";
        let e = encode_base36(Utc::now().timestamp_millis() - 60_000);
        let s = sign(secret, hash, &e);
        assert_eq!(
            check_query_sign(secret, hash, Some(&s), Some(&e)),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn rejects_wrong_signature() {
        let e = encode_base36(Utc::now().timestamp_millis() + 60_000);
        assert_eq!(
            check_query_sign("s3cr3t", "abc123", Some("bogus"), Some(&e)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_missing_params() {
        assert_eq!(
            check_query_sign("s3cr3t", "abc123", None, Some("1")),
            Err(SignatureError::MissingParam)
        );
        assert_eq!(
            check_query_sign("s3cr3t", "abc123", Some("x"), None),
            Err(SignatureError::MissingParam)
        );
    }
}
