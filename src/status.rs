//! Encrypted activation status blob decryption and counter
//! resynchronization.

use crate::crypto;
use crate::error::{PowerAuthError, Result};
use crate::signature::advance_counter;

const MAGIC: [u8; 4] = [0xDE, 0xC0, 0xDE, 0xD1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Created = 1,
    OtpUsed = 2,
    Active = 3,
    Blocked = 4,
    Removed = 5,
    Deadlock = 128,
}

impl ActivationState {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Self::Created),
            2 => Ok(Self::OtpUsed),
            3 => Ok(Self::Active),
            4 => Ok(Self::Blocked),
            5 => Ok(Self::Removed),
            128 => Ok(Self::Deadlock),
            other => Err(PowerAuthError::encryption(format!("unknown activation state byte {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivationStatusBlob {
    pub state: ActivationState,
    pub current_version: u8,
    pub upgrade_version: u8,
    pub fail_count: u8,
    pub max_fail_count: u8,
    pub look_ahead: u8,
    pub server_ctr_byte: u8,
    pub ctr_data_hash: [u8; 16],
}

/// Derive the status-blob IV: `reduce_shared_secret(HMAC_SHA256(challenge,
/// derive(transport_key, 3000))) XOR nonce`. `derive(transport_key, 3000)`
/// reuses the same `AES-CBC(transport, ZERO_IV, U64_BE(3000))` schedule as
/// the key-protection layer's `derive_all`, applied ad hoc for this index.
fn derive_status_iv(transport_key: &[u8; 16], challenge: &[u8; 16], nonce: &[u8; 16]) -> Result<[u8; 16]> {
    let zero_iv = [0u8; 16];
    let mut index_block = [0u8; 16];
    index_block[8..].copy_from_slice(&3000u64.to_be_bytes());
    let derived_index_key = crypto::aes_cbc_encrypt(transport_key, &zero_iv, &index_block)?;
    let mut derived = [0u8; 16];
    derived.copy_from_slice(&derived_index_key[..16]);

    let mac = crypto::hmac_sha256_full(challenge, &derived);
    let reduced = crypto::reduce_shared_secret(&mac)?;
    let mut iv = [0u8; 16];
    for i in 0..16 {
        iv[i] = reduced[i] ^ nonce[i];
    }
    Ok(iv)
}

/// Decrypt and parse the 32-byte encrypted activation status blob.
pub fn decrypt_status_blob(transport_key: &[u8; 16], challenge: &[u8; 16], nonce: &[u8; 16], encrypted_status_blob: &[u8; 32]) -> Result<ActivationStatusBlob> {
    let iv = derive_status_iv(transport_key, challenge, nonce)?;
    let plain = crypto::aes_cbc_decrypt(transport_key, &iv, encrypted_status_blob)?;
    if plain.len() != 32 {
        return Err(PowerAuthError::encryption("decrypted status blob must be 32 bytes"));
    }
    if plain[0..4] != MAGIC {
        return Err(PowerAuthError::encryption("status blob magic mismatch"));
    }
    let state = ActivationState::from_byte(plain[4])?;
    let mut ctr_data_hash = [0u8; 16];
    ctr_data_hash.copy_from_slice(&plain[12..28]);
    Ok(ActivationStatusBlob {
        state,
        current_version: plain[5],
        upgrade_version: plain[6],
        fail_count: plain[8],
        max_fail_count: plain[9],
        look_ahead: plain[10],
        server_ctr_byte: plain[11],
        ctr_data_hash,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSyncResult {
    Ok,
    CalculateSignature,
    Updated,
    Invalid,
}

/// Outcome of `synchronize_counter`: the decision plus, for `Updated`, the
/// new local counter state to persist.
pub struct CounterSyncOutcome {
    pub result: CounterSyncResult,
    pub new_signature_counter_data: Option<[u8; 16]>,
    pub new_signature_counter_byte: Option<u8>,
}

fn hash_distance(local_ctr: &[u8; 16], server_hash: &[u8; 16], look_ahead: u8) -> Result<Option<u8>> {
    let mut current = *local_ctr;
    if &current[..] == &server_hash[..] {
        return Ok(Some(0));
    }
    for d in 1..=look_ahead {
        current = advance_counter(&current)?;
        if current == *server_hash {
            return Ok(Some(d));
        }
    }
    Ok(None)
}

fn byte_distance(local_byte: u8, server_byte: u8) -> i16 {
    let diff = (local_byte as i16) - (server_byte as i16);
    ((diff + 128).rem_euclid(256)) - 128
}

/// Synchronize the local counter state against a decrypted status blob.
pub fn synchronize_counter(local_ctr: &[u8; 16], local_byte: u8, has_signature_counter_byte: bool, status: &ActivationStatusBlob) -> Result<CounterSyncOutcome> {
    if !has_signature_counter_byte {
        return match hash_distance(local_ctr, &status.ctr_data_hash, status.look_ahead)? {
            Some(0) => Ok(CounterSyncOutcome {
                result: CounterSyncResult::Updated,
                new_signature_counter_data: Some(*local_ctr),
                new_signature_counter_byte: Some(status.server_ctr_byte),
            }),
            _ => Ok(CounterSyncOutcome {
                result: CounterSyncResult::Ok,
                new_signature_counter_data: None,
                new_signature_counter_byte: None,
            }),
        };
    }

    let hd = hash_distance(local_ctr, &status.ctr_data_hash, status.look_ahead)?;
    let bd = byte_distance(local_byte, status.server_ctr_byte);
    let half = (status.look_ahead / 2) as i16;
    let look_ahead = status.look_ahead as i16;

    let outcome = match (bd, hd) {
        (0, Some(0)) => CounterSyncOutcome {
            result: CounterSyncResult::Ok,
            new_signature_counter_data: None,
            new_signature_counter_byte: None,
        },
        (b, None) if b > 0 && b <= half => CounterSyncOutcome {
            result: CounterSyncResult::Ok,
            new_signature_counter_data: None,
            new_signature_counter_byte: None,
        },
        (b, None) if b > half && b <= look_ahead => CounterSyncOutcome {
            result: CounterSyncResult::CalculateSignature,
            new_signature_counter_data: None,
            new_signature_counter_byte: None,
        },
        (b, _) if b > look_ahead => CounterSyncOutcome {
            result: CounterSyncResult::Invalid,
            new_signature_counter_data: None,
            new_signature_counter_byte: None,
        },
        (b, Some(d)) if b < 0 && (-b) == d as i16 && d > 0 => {
            let mut new_ctr = *local_ctr;
            for _ in 0..d {
                new_ctr = advance_counter(&new_ctr)?;
            }
            CounterSyncOutcome {
                result: CounterSyncResult::Updated,
                new_signature_counter_data: Some(new_ctr),
                new_signature_counter_byte: Some(status.server_ctr_byte),
            }
        }
        _ => CounterSyncOutcome {
            result: CounterSyncResult::Invalid,
            new_signature_counter_data: None,
            new_signature_counter_byte: None,
        },
    };
    Ok(outcome)
}
