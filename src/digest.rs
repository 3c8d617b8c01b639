//! Keyed and plain digests shared by the container and share formats.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

pub type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 hasher keyed by the symmetric key. Both container
/// checksums are produced by hashers from here.
pub fn key_hmac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// Fingerprint of a secret: base64url (padded) of its SHA-512.
pub fn payload_digest(payload: &[u8]) -> String {
    URL_SAFE.encode(Sha512::digest(payload))
}
