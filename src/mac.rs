//! Chained HMAC-SHA256 primitive underlying the macaroon construction.

use bitcoin_hashes::{hex::ToHex, hmac, sha256, Hash, HashEngine};

/// Matches a 64-character lowercase hex string (32 bytes).
fn looks_like_hex_key(secret: &str) -> bool {
    secret.len() == 64 && secret.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// The initial HMAC key derived from the process secret: hex-decoded if the
/// secret is a 64-char lowercase hex string, else its raw UTF-8 bytes.
fn initial_key(secret: &str) -> Vec<u8> {
    if looks_like_hex_key(secret) {
        hex::decode(secret).expect("validated hex string")
    } else {
        secret.as_bytes().to_vec()
    }
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut engine = hmac::HmacEngine::<sha256::Hash>::new(key);
    engine.input(msg);
    hmac::Hmac::<sha256::Hash>::from_engine(engine).into_inner()
}

/// Computes the final chained signature over `id` followed by `caveats`, in
/// order. `sig_0 = HMAC(secret, id)`; each subsequent caveat chains off the
/// hex ASCII representation of the prior signature.
pub fn chain(secret: &str, id: &str, caveats: &[String]) -> [u8; 32] {
    let mut sig = hmac_sha256(&initial_key(secret), id.as_bytes());
    for caveat in caveats {
        let key = sig.to_hex();
        sig = hmac_sha256(key.as_bytes(), caveat.as_bytes());
    }
    sig
}

/// Constant-time comparison of two signatures.
pub fn signatures_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
