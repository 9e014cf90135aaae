//! Activation configuration, transient activation data, and the
//! three-step activation handshake.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use p256::PublicKey;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;

use crate::codes;
use crate::crypto;
use crate::error::{PowerAuthError, Result};
use crate::keys::{derive_all, lock, DerivedKeys, LockRequest, SignatureFactor, SignatureKeys, UnlockKeys};

/// Immutable per-session configuration.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSetup {
    #[serde_as(as = "Base64")]
    pub application_key: [u8; 16],
    #[serde_as(as = "Base64")]
    pub application_secret: [u8; 16],
    #[serde_as(as = "Base64")]
    pub master_server_public_key: [u8; 33],
    pub session_identifier: u32,
    #[serde_as(as = "Option<Base64>")]
    pub external_encryption_key: Option<[u8; 16]>,
}

const CONFIG_TAG_MASTER_SERVER_PUBLIC_KEY: u8 = 0x01;

impl SessionSetup {
    /// Validate construction-time invariants; failure here is the only way
    /// a `Session` enters the terminal `Invalid` state.
    pub fn validate(&self) -> Result<()> {
        crypto::import_public_key(&self.master_server_public_key)?;
        Ok(())
    }

    /// Pack into the Base64 textual configuration form: version byte
    /// `0x01`, length-prefixed `applicationKey`, length-prefixed
    /// `applicationSecret`, then a list of named keys (only id `0x01` is
    /// currently defined: the P-256 master server public key).
    pub fn to_config_string(&self) -> String {
        let mut buf = Vec::new();
        buf.push(0x01u8);
        buf.push(self.application_key.len() as u8);
        buf.extend_from_slice(&self.application_key);
        buf.push(self.application_secret.len() as u8);
        buf.extend_from_slice(&self.application_secret);
        buf.push(CONFIG_TAG_MASTER_SERVER_PUBLIC_KEY);
        buf.push(self.master_server_public_key.len() as u8);
        buf.extend_from_slice(&self.master_server_public_key);
        B64.encode(buf)
    }

    /// Unpack the Base64 textual configuration form. Unknown key-ids are
    /// skipped; absence of id `0x01` is an error.
    pub fn from_config_string(s: &str) -> Result<Self> {
        let buf = B64.decode(s).map_err(|_| PowerAuthError::encryption("invalid base64 session config"))?;
        let mut pos = 0usize;
        let read_u8 = |buf: &[u8], pos: &mut usize| -> Result<u8> {
            let b = *buf.get(*pos).ok_or_else(|| PowerAuthError::wrong_param("truncated session config"))?;
            *pos += 1;
            Ok(b)
        };
        let read_len_prefixed = |buf: &[u8], pos: &mut usize| -> Result<Vec<u8>> {
            let len = read_u8(buf, pos)? as usize;
            let slice = buf
                .get(*pos..*pos + len)
                .ok_or_else(|| PowerAuthError::wrong_param("truncated session config field"))?
                .to_vec();
            *pos += len;
            Ok(slice)
        };

        let version = read_u8(&buf, &mut pos)?;
        if version != 0x01 {
            return Err(PowerAuthError::wrong_param("unsupported session config version"));
        }
        let application_key_v = read_len_prefixed(&buf, &mut pos)?;
        let application_secret_v = read_len_prefixed(&buf, &mut pos)?;
        if application_key_v.len() != 16 || application_secret_v.len() != 16 {
            return Err(PowerAuthError::wrong_param("applicationKey/applicationSecret must be 16 bytes"));
        }

        let mut master_server_public_key: Option<[u8; 33]> = None;
        while pos < buf.len() {
            let tag = read_u8(&buf, &mut pos)?;
            let value = read_len_prefixed(&buf, &mut pos)?;
            if tag == CONFIG_TAG_MASTER_SERVER_PUBLIC_KEY {
                if value.len() != 33 {
                    return Err(PowerAuthError::wrong_param("master server public key must be 33 bytes"));
                }
                let mut arr = [0u8; 33];
                arr.copy_from_slice(&value);
                master_server_public_key = Some(arr);
            }
            // unknown tags are skipped by construction: we already consumed
            // their length-prefixed value above.
        }

        let master_server_public_key = master_server_public_key.ok_or_else(|| PowerAuthError::wrong_param("missing master server public key (id 0x01)"))?;

        let mut application_key = [0u8; 16];
        application_key.copy_from_slice(&application_key_v);
        let mut application_secret = [0u8; 16];
        application_secret.copy_from_slice(&application_secret_v);

        let setup = Self {
            application_key,
            application_secret,
            master_server_public_key,
            session_identifier: 0,
            external_encryption_key: None,
        };
        setup.validate()?;
        Ok(setup)
    }
}

/// Recovery code + PUK pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryData {
    pub recovery_code: String,
    pub puk: String,
}

impl RecoveryData {
    pub fn validate(&self) -> Result<()> {
        if !codes::validate_recovery_code(&self.recovery_code) {
            return Err(PowerAuthError::wrong_param("invalid recovery code"));
        }
        if !codes::validate_recovery_puk(&self.puk) {
            return Err(PowerAuthError::wrong_param("invalid recovery PUK"));
        }
        Ok(())
    }
}

/// Transient data present only during activation.
pub struct ActivationData {
    pub device_key_pair: crypto::KeyPair,
    pub server_public_key: Option<PublicKey>,
    pub ctr_data: Option<[u8; 16]>,
    pub activation_code: Option<String>,
    pub activation_id: Option<String>,
    pub master_shared_secret: Option<[u8; 16]>,
    pub recovery_data: Option<RecoveryData>,
}

impl ActivationData {
    pub fn new_with_fresh_device_key() -> Self {
        Self {
            device_key_pair: crypto::generate_key_pair(),
            server_public_key: None,
            ctr_data: None,
            activation_code: None,
            activation_id: None,
            master_shared_secret: None,
            recovery_data: None,
        }
    }
}

/// Step 1: `start_activation`. Returns the Base64-encoded device public key.
pub fn start_activation(setup: &SessionSetup, code: Option<&str>, signature: Option<&[u8]>) -> Result<(ActivationData, String)> {
    if let Some(code) = code {
        if !codes::validate_activation_code(code) {
            return Err(PowerAuthError::wrong_param("invalid activation code"));
        }
        if let Some(sig) = signature {
            let master_pub = crypto::import_public_key(&setup.master_server_public_key)?;
            if !crypto::ecdsa_verify(code.as_bytes(), sig, &master_pub)? {
                return Err(PowerAuthError::encryption("activation code signature verification failed"));
            }
        }
    }
    let mut ad = ActivationData::new_with_fresh_device_key();
    ad.activation_code = code.map(|s| s.to_string());
    let device_public_b64 = B64.encode(crypto::export_public_key(&ad.device_key_pair.public));
    Ok((ad, device_public_b64))
}

/// `decimalized(last 4 bytes of SHA-256, sign bit masked, mod 10^8, zero-padded to 8 digits)`.
pub fn decimalize_sha256(data: &[u8]) -> String {
    let hash = crypto::sha256(data);
    let tail = &hash[28..32];
    let mut masked = [tail[0] & 0x7F, tail[1], tail[2], tail[3]];
    masked[0] &= 0x7F;
    let value = u32::from_be_bytes(masked);
    format!("{:08}", value % 100_000_000)
}

/// Step 2: `validate_activation_response`. Returns the 8-digit fingerprint.
pub fn validate_activation_response(
    setup: &SessionSetup,
    ad: &mut ActivationData,
    server_public_key_bytes: &[u8; 33],
    activation_id: &str,
    ctr_data_b64: &str,
    recovery: Option<RecoveryData>,
) -> Result<String> {
    let _ = setup;
    let ctr_data = B64.decode(ctr_data_b64).map_err(|_| PowerAuthError::encryption("invalid base64 ctrData"))?;
    if ctr_data.len() != 16 {
        return Err(PowerAuthError::wrong_param("ctrData must decode to 16 bytes"));
    }
    let server_public_key = crypto::import_public_key(server_public_key_bytes)?;

    let shared = crypto::ecdh_raw(&ad.device_key_pair.private, &server_public_key)?;
    let master_shared_secret = crypto::reduce_shared_secret(&shared)?;

    let device_x = crypto::affine_x_stripped(&ad.device_key_pair.public);
    let server_x = crypto::affine_x_stripped(&server_public_key);
    let mut fingerprint_input = Vec::with_capacity(device_x.len() + activation_id.len() + server_x.len());
    fingerprint_input.extend_from_slice(&device_x);
    fingerprint_input.extend_from_slice(activation_id.as_bytes());
    fingerprint_input.extend_from_slice(&server_x);
    let fingerprint = decimalize_sha256(&fingerprint_input);

    if let Some(r) = &recovery {
        r.validate()?;
    }

    let mut ctr = [0u8; 16];
    ctr.copy_from_slice(&ctr_data);
    ad.server_public_key = Some(server_public_key);
    ad.ctr_data = Some(ctr);
    ad.activation_id = Some(activation_id.to_string());
    ad.master_shared_secret = Some(master_shared_secret);
    ad.recovery_data = recovery;

    Ok(fingerprint)
}

/// Output of a successful `complete_activation`: everything the session
/// needs to build its `PersistentData`.
pub struct CompletedActivation {
    pub activation_id: String,
    pub ctr_data: [u8; 16],
    pub password_salt: [u8; 16],
    pub keys: SignatureKeys,
    pub server_public_key: [u8; 33],
    pub device_public_key: [u8; 33],
    pub c_device_private_key: Vec<u8>,
    pub c_recovery_data: Vec<u8>,
    pub vault_key: [u8; 16],
}

/// Step 3: `complete_activation`.
pub fn complete_activation(setup: &SessionSetup, ad: &ActivationData, unlock_keys: &UnlockKeys) -> Result<CompletedActivation> {
    let master_shared_secret = ad
        .master_shared_secret
        .ok_or_else(|| PowerAuthError::wrong_state("activation has not completed step 2"))?;
    let activation_id = ad
        .activation_id
        .clone()
        .ok_or_else(|| PowerAuthError::wrong_state("activation has not completed step 2"))?;
    let ctr_data = ad.ctr_data.ok_or_else(|| PowerAuthError::wrong_state("activation has not completed step 2"))?;
    let server_public_key = ad
        .server_public_key
        .as_ref()
        .ok_or_else(|| PowerAuthError::wrong_state("activation has not completed step 2"))?;

    let plain: DerivedKeys = derive_all(&master_shared_secret)?;
    let password_salt_vec = crypto::random_bytes_reject_zero(16)?;
    let mut password_salt = [0u8; 16];
    password_salt.copy_from_slice(&password_salt_vec);

    let mut unlock_with_salt = UnlockKeys {
        possession_unlock_key: unlock_keys.possession_unlock_key,
        biometry_unlock_key: unlock_keys.biometry_unlock_key,
        password: unlock_keys.password.clone(),
        password_salt: Some(password_salt),
        password_iterations: 10_000,
    };
    if unlock_with_salt.password_iterations < 10_000 {
        unlock_with_salt.password_iterations = 10_000;
    }

    let mut keys = SignatureKeys::default();
    let mut factor = SignatureFactor::POSSESSION | SignatureFactor::KNOWLEDGE | SignatureFactor::TRANSPORT | SignatureFactor::FIRST_LOCK;
    if unlock_keys.biometry_unlock_key.is_some() {
        factor |= SignatureFactor::BIOMETRY;
    }
    let lock_req = LockRequest {
        factor,
        ext_key: setup.external_encryption_key.as_ref(),
    };
    lock(&plain, &mut keys, &unlock_with_salt, &lock_req)?;

    let zero_iv = [0u8; 16];
    let c_device_private_key = crypto::aes_cbc_encrypt_pkcs7(&plain.vault, &zero_iv, &crypto::export_private_key(&ad.device_key_pair.private))?;

    let c_recovery_data = if let Some(recovery) = &ad.recovery_data {
        let mut tlv = Vec::new();
        tlv.push(b'R');
        tlv.push(b'1');
        tlv.push(recovery.recovery_code.len() as u8);
        tlv.extend_from_slice(recovery.recovery_code.as_bytes());
        tlv.push(recovery.puk.len() as u8);
        tlv.extend_from_slice(recovery.puk.as_bytes());
        crypto::aes_cbc_encrypt_pkcs7(&plain.vault, &zero_iv, &tlv)?
    } else {
        Vec::new()
    };

    Ok(CompletedActivation {
        activation_id,
        ctr_data,
        password_salt,
        keys,
        server_public_key: crypto::export_public_key(server_public_key),
        device_public_key: crypto::export_public_key(&ad.device_key_pair.public),
        c_device_private_key,
        c_recovery_data,
        vault_key: plain.vault,
    })
}
