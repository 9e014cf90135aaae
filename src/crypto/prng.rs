//! Cryptographically strong random byte generation: a facade over the
//! system random source with an opt-in all-zero rejection loop, plus a
//! variant that additionally rejects a caller-supplied exclusion set.

use std::collections::HashSet;

use rand_core::{OsRng, RngCore};

use crate::error::{PowerAuthError, Result};

const MAX_REJECTION_ATTEMPTS: usize = 16;

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate `n` random bytes, regenerating (bounded to 16 attempts) if the
/// result is all-zeros.
pub fn random_bytes_reject_zero(n: usize) -> Result<Vec<u8>> {
    for _ in 0..MAX_REJECTION_ATTEMPTS {
        let buf = random_bytes(n);
        if !buf.iter().all(|b| *b == 0) {
            return Ok(buf);
        }
    }
    Err(PowerAuthError::encryption("PRNG repeatedly produced an all-zero value"))
}

/// Generate `n` random bytes, rejecting all-zeros and any value already
/// present in `rejects`, bounded to 16 attempts.
pub fn unique_random_bytes(n: usize, rejects: &HashSet<Vec<u8>>) -> Result<Vec<u8>> {
    for _ in 0..MAX_REJECTION_ATTEMPTS {
        let buf = random_bytes(n);
        if buf.iter().all(|b| *b == 0) {
            continue;
        }
        if !rejects.contains(&buf) {
            return Ok(buf);
        }
    }
    Err(PowerAuthError::encryption("PRNG could not produce a unique, non-zero value"))
}
