//! Inbound webhook signature verification (§4.9, §6, §9 HMAC expansion).
//!
//! Each forge signs (GitHub, Forgejo) or stamps (GitLab) its webhook
//! deliveries differently. This crate collects the constant-time
//! comparisons so `docbuilder-forge`'s per-forge `ForgeClient::validate_webhook`
//! implementations share one HMAC code path instead of three: signing
//! (`sign_hex`) and verifying (`verify_hex`) share the same keyed-MAC
//! computation, inverted for the inbound-vs-outbound direction.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 of `body` keyed by `secret`, in
/// the `sha256=<hex>` form GitHub and Forgejo send in
/// `X-Hub-Signature-256`.
pub fn sign_hex(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a GitHub/Forgejo-style `X-Hub-Signature-256: sha256=<hex>`
/// header against `body`, keyed by the per-forge secret configured for
/// this repository. Returns `false` on any malformed header rather than
/// erroring — an invalid signature is a rejection, not a crash.
pub fn verify_sha256_prefixed(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    verify_hex(secret, body, hex_sig)
}

/// Verify a bare hex-encoded HMAC-SHA256 signature (no `sha256=` prefix)
/// against `body`, using constant-time comparison on the decoded bytes.
pub fn verify_hex(secret: &str, body: &[u8], hex_sig: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Verify a GitLab-style `X-Gitlab-Token` header: a plain shared secret,
/// compared in constant time (GitLab does not sign the body, it just
/// echoes the configured token).
pub fn verify_shared_token(secret: &str, header_value: &str) -> bool {
    use subtle_eq::constant_time_eq;
    constant_time_eq(secret.as_bytes(), header_value.as_bytes())
}

/// Constant-time byte comparison, inlined rather than pulled in as a
/// dependency since it is a handful of lines and has no other use here.
mod subtle_eq {
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}
