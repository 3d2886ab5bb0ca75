use sha2::{Digest, Sha256};

const FINGERPRINT_BYTES: usize = 16;

/// Computes the fingerprint of a raw request body.
///
/// SHA-256 truncated to 128 bits, hex encoded. Only ever compared for equality.
pub fn fingerprint(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex::encode(&digest[..FINGERPRINT_BYTES])
}
