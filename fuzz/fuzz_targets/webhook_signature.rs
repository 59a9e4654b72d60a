#![no_main]

use docbuilder_webhook::{sign_hex, verify_hex, verify_sha256_prefixed};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], &[u8])| {
    let (secret_bytes, body) = data;
    let Ok(secret) = std::str::from_utf8(secret_bytes) else { return };

    // A correctly computed signature must always verify.
    let signature = sign_hex(secret, body);
    assert!(verify_hex(secret, body, &signature));
    assert!(verify_sha256_prefixed(secret, body, &format!("sha256={signature}")));

    // Any malformed header must be rejected, never panic.
    assert!(!verify_sha256_prefixed(secret, body, "not-a-signature"));
    assert!(!verify_hex(secret, body, "zz"));
});
