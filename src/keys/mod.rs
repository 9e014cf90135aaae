//! Key-protection layer: the per-factor key schedule and the lock/unlock
//! algebra that wraps the five signature keys at rest.

use std::ops::{BitOr, BitOrAssign};

use crate::crypto;
use crate::error::{PowerAuthError, Result};

/// Bitmask identifying which signature factor(s) an operation concerns.
/// `FirstLock` is a pseudo-factor used only during `complete_activation` to
/// indicate the very first lock of a key (establishing `usesExternalKey`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureFactor(u32);

impl SignatureFactor {
    pub const POSSESSION: SignatureFactor = SignatureFactor(0x0001);
    pub const KNOWLEDGE: SignatureFactor = SignatureFactor(0x0002);
    pub const BIOMETRY: SignatureFactor = SignatureFactor(0x0004);
    pub const TRANSPORT: SignatureFactor = SignatureFactor(0x1000);
    pub const FIRST_LOCK: SignatureFactor = SignatureFactor(0x8000);
    pub const NONE: SignatureFactor = SignatureFactor(0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: SignatureFactor) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: SignatureFactor) -> bool {
        self.0 & other.0 != 0
    }

    pub fn has_any_real_factor(self) -> bool {
        self.intersects(Self::POSSESSION) || self.intersects(Self::KNOWLEDGE) || self.intersects(Self::BIOMETRY) || self.intersects(Self::TRANSPORT)
    }
}

impl BitOr for SignatureFactor {
    type Output = SignatureFactor;
    fn bitor(self, rhs: SignatureFactor) -> SignatureFactor {
        SignatureFactor(self.0 | rhs.0)
    }
}

impl BitOrAssign for SignatureFactor {
    fn bitor_assign(&mut self, rhs: SignatureFactor) {
        self.0 |= rhs.0;
    }
}

/// The ordered list of factors used to build online/offline signature
/// keys. The ordering is fixed.
pub const SIGNATURE_FACTOR_ORDER: [SignatureFactor; 3] = [
    SignatureFactor::POSSESSION,
    SignatureFactor::KNOWLEDGE,
    SignatureFactor::BIOMETRY,
];

/// The five plain (unlocked) 16-byte secret keys derived from the
/// ECDH-reduced master secret.
#[derive(Debug, Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub possession: [u8; 16],
    pub knowledge: [u8; 16],
    pub biometry: [u8; 16],
    pub transport: [u8; 16],
    pub vault: [u8; 16],
}

/// `derive_all`: `k_i = AES-CBC(master, ZERO_IV, U64_BE(i))` for
/// `i in {1, 2, 3, 1000, 2000}`.
pub fn derive_all(master: &[u8; 16]) -> Result<DerivedKeys> {
    let zero_iv = [0u8; 16];
    let derive_one = |index: u64| -> Result<[u8; 16]> {
        let block = index.to_be_bytes();
        let mut padded = [0u8; 16];
        padded[8..].copy_from_slice(&block);
        let ct = crypto::aes_cbc_encrypt(master, &zero_iv, &padded)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&ct[..16]);
        Ok(out)
    };
    Ok(DerivedKeys {
        possession: derive_one(1)?,
        knowledge: derive_one(2)?,
        biometry: derive_one(3)?,
        transport: derive_one(1000)?,
        vault: derive_one(2000)?,
    })
}

/// The five signature keys as stored at rest: ciphertext bytes, plus the
/// `usesExternalKey` flag recorded at first lock.
#[derive(Debug, Clone, Default)]
pub struct SignatureKeys {
    pub possession: Vec<u8>,
    pub knowledge: Vec<u8>,
    /// Empty iff the biometry factor is disabled.
    pub biometry: Vec<u8>,
    pub transport: Vec<u8>,
    pub uses_external_key: bool,
}

impl SignatureKeys {
    pub fn has_biometry(&self) -> bool {
        !self.biometry.is_empty()
    }
}

/// Caller-supplied unlock material for a lock/unlock operation.
#[derive(Default)]
pub struct UnlockKeys {
    pub possession_unlock_key: Option<[u8; 16]>,
    pub biometry_unlock_key: Option<[u8; 16]>,
    pub password: Option<Vec<u8>>,
    pub password_salt: Option<[u8; 16]>,
    pub password_iterations: u32,
}

/// A lock/unlock request: which factors to operate on, plus an optional EEK.
pub struct LockRequest<'a> {
    pub factor: SignatureFactor,
    pub ext_key: Option<&'a [u8; 16]>,
}

fn protection_key_for(factor: SignatureFactor, unlock: &UnlockKeys) -> Result<[u8; 16]> {
    if factor.contains(SignatureFactor::POSSESSION) || factor.contains(SignatureFactor::TRANSPORT) {
        unlock
            .possession_unlock_key
            .ok_or_else(|| PowerAuthError::wrong_param("missing possession unlock key"))
    } else if factor.contains(SignatureFactor::KNOWLEDGE) {
        let password = unlock
            .password
            .as_ref()
            .ok_or_else(|| PowerAuthError::wrong_param("missing password"))?;
        let salt = unlock
            .password_salt
            .ok_or_else(|| PowerAuthError::wrong_param("missing password salt"))?;
        let derived = crypto::pbkdf2_hmac_sha1(password, &salt, unlock.password_iterations, 16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&derived);
        Ok(out)
    } else if factor.contains(SignatureFactor::BIOMETRY) {
        unlock
            .biometry_unlock_key
            .ok_or_else(|| PowerAuthError::wrong_param("missing biometry unlock key"))
    } else {
        Err(PowerAuthError::wrong_param("unsupported factor for protection key derivation"))
    }
}

/// `validate_unlock_keys`: enforce the factor/key-material sanity rules.
pub fn validate_unlock_keys(unlock: &UnlockKeys, factor: SignatureFactor, eek: Option<&[u8; 16]>) -> Result<()> {
    if !factor.has_any_real_factor() {
        return Err(PowerAuthError::wrong_param("factor mask must contain at least one real bit"));
    }
    let knowledge_or_biometry_only = factor.intersects(SignatureFactor::KNOWLEDGE | SignatureFactor::BIOMETRY)
        && !factor.intersects(SignatureFactor::POSSESSION | SignatureFactor::TRANSPORT);
    if knowledge_or_biometry_only {
        return Err(PowerAuthError::wrong_param(
            "Knowledge|Biometry alone is forbidden; must be paired with Possession or Transport",
        ));
    }
    if factor.intersects(SignatureFactor::POSSESSION | SignatureFactor::TRANSPORT) {
        match unlock.possession_unlock_key {
            Some(k) if k != [0u8; 16] => {}
            _ => return Err(PowerAuthError::wrong_param("possession unlock key must be 16 non-zero bytes")),
        }
    }
    if factor.contains(SignatureFactor::BIOMETRY) {
        match unlock.biometry_unlock_key {
            Some(k) if k != [0u8; 16] => {}
            _ => return Err(PowerAuthError::wrong_param("biometry unlock key must be 16 non-zero bytes")),
        }
    }
    if factor.contains(SignatureFactor::KNOWLEDGE) {
        let password_len = unlock.password.as_ref().map(|p| p.len()).unwrap_or(0);
        if password_len < 4 {
            return Err(PowerAuthError::wrong_param("password must be at least 4 bytes"));
        }
    }
    if let Some(_eek) = eek {
        // 16-byte array type already enforces length; nothing further to check.
    }
    Ok(())
}

/// `lock`: encrypt the requested subset of `plain` under its protection key,
/// applying a second EEK layer for knowledge/biometry when `req.ext_key` is
/// present. Enforces that `usesExternalKey` is set once and thereafter must
/// agree with the destination's existing flag (unless `FirstLock` is set).
pub fn lock(plain: &DerivedKeys, dest: &mut SignatureKeys, unlock: &UnlockKeys, req: &LockRequest) -> Result<()> {
    let zero_iv = [0u8; 16];
    let first_lock = req.factor.contains(SignatureFactor::FIRST_LOCK);
    let wants_eek = req.ext_key.is_some();

    if !first_lock && dest.uses_external_key != wants_eek && req.factor.intersects(SignatureFactor::KNOWLEDGE | SignatureFactor::BIOMETRY) {
        return Err(PowerAuthError::wrong_param("EEK presence does not match the existing usesExternalKey flag"));
    }

    if req.factor.contains(SignatureFactor::POSSESSION) {
        let pk = protection_key_for(SignatureFactor::POSSESSION, unlock)?;
        dest.possession = crypto::aes_cbc_encrypt(&pk, &zero_iv, &plain.possession)?;
    }
    if req.factor.contains(SignatureFactor::TRANSPORT) {
        let pk = protection_key_for(SignatureFactor::TRANSPORT, unlock)?;
        dest.transport = crypto::aes_cbc_encrypt(&pk, &zero_iv, &plain.transport)?;
    }
    if req.factor.contains(SignatureFactor::KNOWLEDGE) {
        let pk = protection_key_for(SignatureFactor::KNOWLEDGE, unlock)?;
        let mut ct = crypto::aes_cbc_encrypt(&pk, &zero_iv, &plain.knowledge)?;
        if let Some(eek) = req.ext_key {
            ct = crypto::aes_cbc_encrypt(eek, &zero_iv, &ct)?;
        }
        dest.knowledge = ct;
    }
    if req.factor.contains(SignatureFactor::BIOMETRY) {
        let pk = protection_key_for(SignatureFactor::BIOMETRY, unlock)?;
        let mut ct = crypto::aes_cbc_encrypt(&pk, &zero_iv, &plain.biometry)?;
        if let Some(eek) = req.ext_key {
            ct = crypto::aes_cbc_encrypt(eek, &zero_iv, &ct)?;
        }
        dest.biometry = ct;
    }

    if first_lock || dest.uses_external_key == wants_eek {
        dest.uses_external_key = wants_eek;
    }
    Ok(())
}

/// `unlock`: the inverse of `lock`.
pub fn unlock(secret: &SignatureKeys, unlock_keys: &UnlockKeys, req: &LockRequest) -> Result<DerivedKeys> {
    let zero_iv = [0u8; 16];
    let wants_eek = req.ext_key.is_some();
    if req.factor.intersects(SignatureFactor::KNOWLEDGE | SignatureFactor::BIOMETRY) && secret.uses_external_key != wants_eek {
        return Err(PowerAuthError::wrong_param("EEK presence does not match secret.usesExternalKey"));
    }

    let mut out = DerivedKeys {
        possession: [0u8; 16],
        knowledge: [0u8; 16],
        biometry: [0u8; 16],
        transport: [0u8; 16],
        vault: [0u8; 16],
    };

    if req.factor.contains(SignatureFactor::POSSESSION) {
        let pk = protection_key_for(SignatureFactor::POSSESSION, unlock_keys)?;
        let pt = crypto::aes_cbc_decrypt(&pk, &zero_iv, &secret.possession)?;
        out.possession.copy_from_slice(&pt);
    }
    if req.factor.contains(SignatureFactor::TRANSPORT) {
        let pk = protection_key_for(SignatureFactor::TRANSPORT, unlock_keys)?;
        let pt = crypto::aes_cbc_decrypt(&pk, &zero_iv, &secret.transport)?;
        out.transport.copy_from_slice(&pt);
    }
    if req.factor.contains(SignatureFactor::KNOWLEDGE) {
        let pk = protection_key_for(SignatureFactor::KNOWLEDGE, unlock_keys)?;
        let mut ct = secret.knowledge.clone();
        if let Some(eek) = req.ext_key {
            ct = crypto::aes_cbc_decrypt(eek, &zero_iv, &ct)?;
        }
        let pt = crypto::aes_cbc_decrypt(&pk, &zero_iv, &ct)?;
        out.knowledge.copy_from_slice(&pt);
    }
    if req.factor.contains(SignatureFactor::BIOMETRY) {
        if !secret.has_biometry() {
            return Err(PowerAuthError::wrong_param("biometry factor is disabled"));
        }
        let pk = protection_key_for(SignatureFactor::BIOMETRY, unlock_keys)?;
        let mut ct = secret.biometry.clone();
        if let Some(eek) = req.ext_key {
            ct = crypto::aes_cbc_decrypt(eek, &zero_iv, &ct)?;
        }
        let pt = crypto::aes_cbc_decrypt(&pk, &zero_iv, &ct)?;
        out.biometry.copy_from_slice(&pt);
    }

    Ok(out)
}

/// `protect_with_eek`: add (`add = true`) or strip (`add = false`) one
/// AES-CBC layer wrapping knowledge (always) and biometry (if present).
pub fn protect_with_eek(secret: &mut SignatureKeys, eek: &[u8; 16], add: bool) -> Result<()> {
    let zero_iv = [0u8; 16];
    if add == secret.uses_external_key {
        return Err(PowerAuthError::wrong_param(
            "EEK wrap/unwrap requested but usesExternalKey flag already reflects that state",
        ));
    }
    if add {
        secret.knowledge = crypto::aes_cbc_encrypt(eek, &zero_iv, &secret.knowledge)?;
        if secret.has_biometry() {
            secret.biometry = crypto::aes_cbc_encrypt(eek, &zero_iv, &secret.biometry)?;
        }
    } else {
        secret.knowledge = crypto::aes_cbc_decrypt(eek, &zero_iv, &secret.knowledge)?;
        if secret.has_biometry() {
            secret.biometry = crypto::aes_cbc_decrypt(eek, &zero_iv, &secret.biometry)?;
        }
    }
    secret.uses_external_key = add;
    Ok(())
}

/// `generate_signature_unlock_key`: a fresh random 16-byte possession or
/// biometry unlock key.
pub fn generate_signature_unlock_key() -> Result<[u8; 16]> {
    let bytes = crypto::random_bytes_reject_zero(16)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// `normalize_signature_unlock_key_from_data`: PBKDF2-normalize arbitrary
/// caller data (e.g. a biometric template) into a 16-byte unlock key.
pub fn normalize_signature_unlock_key_from_data(data: &[u8], salt: &[u8; 16]) -> Result<[u8; 16]> {
    let derived = crypto::pbkdf2_hmac_sha1(data, salt, 10_000, 16)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&derived);
    Ok(out)
}
