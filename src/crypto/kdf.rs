//! ANSI X9.63 KDF with SHA-256, and the ECDH shared-secret reduction.

use sha2::{Digest, Sha256};

use crate::error::{PowerAuthError, Result};

/// ANSI X9.63 KDF: derive `out_len` bytes from `shared || info`, with a
/// big-endian 32-bit counter starting at 1, hashed with SHA-256 per block.
pub fn ecdh_kdf_x963_sha256(shared: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut hasher = Sha256::new();
        hasher.update(shared);
        hasher.update(counter.to_be_bytes());
        hasher.update(info);
        let block = hasher.finalize();
        let remaining = out_len - out.len();
        out.extend_from_slice(&block[..remaining.min(block.len())]);
        counter += 1;
    }
    out
}

/// Reduce a 32-byte ECDH shared secret to 16 bytes by XOR-ing the two
/// halves together.
pub fn reduce_shared_secret(shared: &[u8]) -> Result<[u8; 16]> {
    if shared.len() != 32 {
        return Err(PowerAuthError::wrong_param("shared secret must be 32 bytes"));
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = shared[i] ^ shared[i + 16];
    }
    Ok(out)
}

/// `XOR_halves(HMAC_SHA256(key, idx))`, used both for the ECIES internal IV
/// derivation and (mirrored form) for the activation key schedule's
/// master-secret-to-derived-key step.
pub fn xor_halves(full_32: &[u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = full_32[i] ^ full_32[i + 16];
    }
    out
}
