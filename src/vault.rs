//! Vault key decryption and the operations it gates: password change,
//! biometry factor rotation, derived-key generation, and device-private-key
//! signing.

use p256::PublicKey;

use crate::crypto;
use crate::error::{PowerAuthError, Result};
use crate::keys::{derive_all, lock, unlock, DerivedKeys, LockRequest, SignatureFactor, SignatureKeys, UnlockKeys};

/// Decrypt the server-delivered encrypted vault key under `transportKey`,
/// after confirming the caller can unlock possession (proof the request
/// actually came from this device).
pub fn decrypt_vault_key(c_vault: &[u8], keys: &SignatureKeys, unlock_keys: &UnlockKeys) -> Result<[u8; 16]> {
    let possession_req = LockRequest {
        factor: SignatureFactor::TRANSPORT,
        ext_key: None,
    };
    let derived = unlock(keys, unlock_keys, &possession_req)?;
    let zero_iv = [0u8; 16];
    let plain = crypto::aes_cbc_decrypt_pkcs7(&derived.transport, &zero_iv, c_vault)?;
    if plain.len() != 16 {
        return Err(PowerAuthError::encryption("decrypted vault key must be 16 bytes"));
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&plain);
    Ok(out)
}

/// `change_password`: unlock knowledge under the old password, generate a
/// fresh salt, relock under the new one. Does not verify `old` against any
/// server-side record; correctness of `old` is the caller's responsibility.
pub fn change_password(keys: &mut SignatureKeys, old: &[u8], old_salt: &[u8; 16], old_iterations: u32, new: &[u8], new_iterations: u32) -> Result<[u8; 16]> {
    let old_unlock = UnlockKeys {
        possession_unlock_key: None,
        biometry_unlock_key: None,
        password: Some(old.to_vec()),
        password_salt: Some(*old_salt),
        password_iterations: old_iterations,
    };
    let derived = unlock(
        keys,
        &old_unlock,
        &LockRequest {
            factor: SignatureFactor::KNOWLEDGE,
            ext_key: None,
        },
    )?;

    let new_salt_vec = crypto::random_bytes_reject_zero(16)?;
    let mut new_salt = [0u8; 16];
    new_salt.copy_from_slice(&new_salt_vec);

    let new_unlock = UnlockKeys {
        possession_unlock_key: None,
        biometry_unlock_key: None,
        password: Some(new.to_vec()),
        password_salt: Some(new_salt),
        password_iterations: new_iterations,
    };
    let plain = DerivedKeys {
        possession: [0u8; 16],
        knowledge: derived.knowledge,
        biometry: [0u8; 16],
        transport: [0u8; 16],
        vault: [0u8; 16],
    };
    lock(
        &plain,
        keys,
        &new_unlock,
        &LockRequest {
            factor: SignatureFactor::KNOWLEDGE,
            ext_key: None,
        },
    )?;
    Ok(new_salt)
}

/// `add_biometry_factor`: recover the master shared secret by re-running
/// ECDH with the vault-decrypted device private key and the server's public
/// key, re-derive the five keys, cross-check the derived vault key against
/// the decrypted one, then lock biometry under the freshly supplied key.
pub fn add_biometry_factor(c_vault: &[u8], keys: &mut SignatureKeys, unlock_keys: &UnlockKeys, c_device_private_key: &[u8], server_public_key: &PublicKey, biometry_unlock_key: &[u8; 16]) -> Result<()> {
    let vault_key = decrypt_vault_key(c_vault, keys, unlock_keys)?;
    let zero_iv = [0u8; 16];
    let device_private_bytes = crypto::aes_cbc_decrypt_pkcs7(&vault_key, &zero_iv, c_device_private_key)?;
    let device_private = crypto::import_private_key(&device_private_bytes)?;

    let shared = crypto::ecdh_raw(&device_private, server_public_key)?;
    let master_shared_secret = crypto::reduce_shared_secret(&shared)?;
    let plain = derive_all(&master_shared_secret)?;

    if plain.vault != vault_key {
        return Err(PowerAuthError::encryption("re-derived vault key does not match server-delivered vault key"));
    }

    let mut biometry_unlock = UnlockKeys::default();
    biometry_unlock.biometry_unlock_key = Some(*biometry_unlock_key);
    lock(
        &plain,
        keys,
        &biometry_unlock,
        &LockRequest {
            factor: SignatureFactor::BIOMETRY,
            ext_key: None,
        },
    )
}

/// `remove_biometry_factor`: clear the stored biometry ciphertext.
pub fn remove_biometry_factor(keys: &mut SignatureKeys) {
    keys.biometry.clear();
}

/// `derive_cryptographic_key`: `AES-CBC(vault_key, ZERO_IV, U64_BE(index))`.
pub fn derive_cryptographic_key(vault_key: &[u8; 16], index: u64) -> Result<[u8; 16]> {
    let zero_iv = [0u8; 16];
    let mut block = [0u8; 16];
    block[8..].copy_from_slice(&index.to_be_bytes());
    let ct = crypto::aes_cbc_encrypt(vault_key, &zero_iv, &block)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&ct[..16]);
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFormat {
    Der,
    Jose,
}

/// `sign_with_device_private_key`: decrypt the vault-wrapped device private
/// key and produce an ECDSA signature over `SHA-256(data)`.
pub fn sign_with_device_private_key(vault_key: &[u8; 16], c_device_private_key: &[u8], data: &[u8], format: SignatureFormat) -> Result<Vec<u8>> {
    let zero_iv = [0u8; 16];
    let device_private_bytes = crypto::aes_cbc_decrypt_pkcs7(vault_key, &zero_iv, c_device_private_key)?;
    let device_private = crypto::import_private_key(&device_private_bytes)?;
    let digest = crypto::sha256(data);
    let der = crypto::ecdsa_sign_prehashed(&digest, &device_private)?;
    match format {
        SignatureFormat::Der => Ok(der),
        SignatureFormat::Jose => crypto::der_to_jose(&der),
    }
}

/// `get_activation_recovery_data`: decrypt and parse the vault-wrapped
/// `(recoveryCode, puk)` TLV (tag `'R'`, version `'1'`).
pub fn get_activation_recovery_data(vault_key: &[u8; 16], c_recovery_data: &[u8]) -> Result<(String, String)> {
    if c_recovery_data.is_empty() {
        return Err(PowerAuthError::wrong_state("no recovery data present on this activation"));
    }
    let zero_iv = [0u8; 16];
    let plain = crypto::aes_cbc_decrypt_pkcs7(vault_key, &zero_iv, c_recovery_data)?;
    if plain.len() < 4 || plain[0] != b'R' || plain[1] != b'1' {
        return Err(PowerAuthError::encryption("malformed recovery data TLV"));
    }
    let mut pos = 2usize;
    let code_len = *plain.get(pos).ok_or_else(|| PowerAuthError::encryption("truncated recovery data"))? as usize;
    pos += 1;
    let code_bytes = plain.get(pos..pos + code_len).ok_or_else(|| PowerAuthError::encryption("truncated recovery code"))?;
    pos += code_len;
    let code = String::from_utf8(code_bytes.to_vec()).map_err(|_| PowerAuthError::encryption("recovery code is not valid UTF-8"))?;

    let puk_len = *plain.get(pos).ok_or_else(|| PowerAuthError::encryption("truncated recovery data"))? as usize;
    pos += 1;
    let puk_bytes = plain.get(pos..pos + puk_len).ok_or_else(|| PowerAuthError::encryption("truncated recovery puk"))?;
    let puk = String::from_utf8(puk_bytes.to_vec()).map_err(|_| PowerAuthError::encryption("recovery puk is not valid UTF-8"))?;

    Ok((code, puk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_all, lock};

    fn sample_unlock() -> UnlockKeys {
        UnlockKeys {
            possession_unlock_key: Some([1u8; 16]),
            biometry_unlock_key: Some([2u8; 16]),
            password: Some(b"password".to_vec()),
            password_salt: Some([3u8; 16]),
            password_iterations: 10_000,
        }
    }

    fn activated_keys() -> (DerivedKeys, SignatureKeys, UnlockKeys) {
        let master = [7u8; 16];
        let plain = derive_all(&master).unwrap();
        let unlock_keys = sample_unlock();
        let mut keys = SignatureKeys::default();
        lock(
            &plain,
            &mut keys,
            &unlock_keys,
            &LockRequest {
                factor: SignatureFactor::POSSESSION | SignatureFactor::KNOWLEDGE | SignatureFactor::BIOMETRY | SignatureFactor::TRANSPORT | SignatureFactor::FIRST_LOCK,
                ext_key: None,
            },
        )
        .unwrap();
        (plain, keys, unlock_keys)
    }

    #[test]
    fn decrypt_vault_key_roundtrips() {
        let (plain, keys, unlock_keys) = activated_keys();
        let zero_iv = [0u8; 16];
        let c_vault = crypto::aes_cbc_encrypt_pkcs7(&plain.transport, &zero_iv, &plain.vault).unwrap();
        let recovered = decrypt_vault_key(&c_vault, &keys, &unlock_keys).unwrap();
        assert_eq!(recovered, plain.vault);
    }

    #[test]
    fn change_password_then_unlock_with_new_password_works() {
        let (_plain, mut keys, _unlock_keys) = activated_keys();
        let old_salt = [3u8; 16];
        let new_salt = change_password(&mut keys, b"password", &old_salt, 10_000, b"new-password", 10_000).unwrap();

        let new_unlock = UnlockKeys {
            possession_unlock_key: None,
            biometry_unlock_key: None,
            password: Some(b"new-password".to_vec()),
            password_salt: Some(new_salt),
            password_iterations: 10_000,
        };
        let recovered = unlock(
            &keys,
            &new_unlock,
            &LockRequest {
                factor: SignatureFactor::KNOWLEDGE,
                ext_key: None,
            },
        )
        .unwrap();
        assert_eq!(recovered.knowledge.len(), 16);
    }

    #[test]
    fn derive_cryptographic_key_is_deterministic_per_index() {
        let vault_key = [4u8; 16];
        let a = derive_cryptographic_key(&vault_key, 42).unwrap();
        let b = derive_cryptographic_key(&vault_key, 42).unwrap();
        let c = derive_cryptographic_key(&vault_key, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sign_with_device_private_key_produces_verifiable_der_and_jose_signatures() {
        let kp = crypto::generate_key_pair();
        let vault_key = [6u8; 16];
        let zero_iv = [0u8; 16];
        let c_device_private_key = crypto::aes_cbc_encrypt_pkcs7(&vault_key, &zero_iv, &crypto::export_private_key(&kp.private)).unwrap();

        let der_sig = sign_with_device_private_key(&vault_key, &c_device_private_key, b"payload", SignatureFormat::Der).unwrap();
        let digest = crypto::sha256(b"payload");
        assert!(crypto::ecdsa_verify_prehashed(&digest, &der_sig, &kp.public).unwrap());

        let jose_sig = sign_with_device_private_key(&vault_key, &c_device_private_key, b"payload", SignatureFormat::Jose).unwrap();
        let der_again = crypto::jose_to_der(&jose_sig).unwrap();
        assert!(crypto::ecdsa_verify_prehashed(&digest, &der_again, &kp.public).unwrap());
    }

    #[test]
    fn activation_recovery_data_roundtrips() {
        let vault_key = [8u8; 16];
        let zero_iv = [0u8; 16];
        let mut tlv = Vec::new();
        tlv.push(b'R');
        tlv.push(b'1');
        tlv.push(19);
        tlv.extend_from_slice(b"AAAAA-AAAAA-AAAAA-A");
        tlv.push(10);
        tlv.extend_from_slice(b"1234567890");
        let c_recovery = crypto::aes_cbc_encrypt_pkcs7(&vault_key, &zero_iv, &tlv).unwrap();

        let (code, puk) = get_activation_recovery_data(&vault_key, &c_recovery).unwrap();
        assert_eq!(code, "AAAAA-AAAAA-AAAAA-A");
        assert_eq!(puk, "1234567890");
    }

    #[test]
    fn empty_recovery_data_is_rejected() {
        let vault_key = [8u8; 16];
        assert!(get_activation_recovery_data(&vault_key, &[]).is_err());
    }

    #[test]
    fn remove_biometry_factor_clears_ciphertext() {
        let (_plain, mut keys, _unlock_keys) = activated_keys();
        assert!(keys.has_biometry());
        remove_biometry_factor(&mut keys);
        assert!(!keys.has_biometry());
    }
}
