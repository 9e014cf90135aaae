//! SHA-256, HMAC-SHA256 and PBKDF2-HMAC-SHA1.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{PowerAuthError, Result};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA256, truncated from the front to `out_len` bytes (`out_len <= 32`).
pub fn hmac_sha256(key: &[u8], data: &[u8], out_len: usize) -> Result<Vec<u8>> {
    if out_len > 32 {
        return Err(PowerAuthError::wrong_param("hmac_sha256 out_len must be <= 32"));
    }
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| PowerAuthError::encryption(format!("hmac key: {e}")))?;
    mac.update(data);
    let full = mac.finalize().into_bytes();
    Ok(full[..out_len].to_vec())
}

/// Convenience: full 32-byte HMAC-SHA256.
pub fn hmac_sha256_full(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn pbkdf2_hmac_sha1(pass: &[u8], salt: &[u8], iters: u32, dklen: usize) -> Result<Vec<u8>> {
    if iters < 1 {
        return Err(PowerAuthError::wrong_param("pbkdf2 iteration count must be positive"));
    }
    let mut out = vec![0u8; dklen];
    pbkdf2::pbkdf2::<Hmac<sha1::Sha1>>(pass, salt, iters, &mut out)
        .map_err(|e| PowerAuthError::encryption(format!("pbkdf2: {e}")))?;
    Ok(out)
}
