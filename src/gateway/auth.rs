//! Peppered credential hashing and constant-time verification.

use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::TenantConfig;

/// `hex(SHA-256(pepper || credential))`, the stored form of a credential.
pub fn hash_credential(pepper: &str, credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(credential.as_bytes());
    hex_encode(&hasher.finalize())
}

pub(crate) fn verify(
    pepper: &str,
    credential: &str,
    config: &TenantConfig,
    now_epoch_seconds: u64,
) -> bool {
    let computed = hash_credential(pepper, credential);

    if constant_time_eq(&computed, &config.api_key_hash) {
        return true;
    }

    // Rotation grace: the previous hash is honored strictly before its
    // expiry. An unparseable expiry disables the grace path.
    let (Some(prev_hash), Some(expiry)) = (
        config.prev_key_hash.as_deref(),
        config.prev_key_expiry.as_deref(),
    ) else {
        return false;
    };
    match OffsetDateTime::parse(expiry, &Rfc3339) {
        Ok(expiry) if (now_epoch_seconds as i64) < expiry.unix_timestamp() => {
            constant_time_eq(&computed, prev_hash)
        }
        _ => false,
    }
}

/// Byte-for-byte comparison with no early return on mismatch.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}
