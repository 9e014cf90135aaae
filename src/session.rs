//! The top-level `Session` object: state machine orchestration, a
//! re-entrant lock wrapping every public operation, and the glue between
//! the key-protection, signature, status, vault and ECIES modules.

use std::cell::RefCell;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use crate::activation::{self, ActivationData, CompletedActivation, RecoveryData, SessionSetup};
use crate::codec::{self, DataVersion, PersistentData};
use crate::crypto;
use crate::ecies::{self, EciesEncryptor, EciesScope};
use crate::error::{PowerAuthError, Result};
use crate::keys::{self, LockRequest, SignatureFactor, UnlockKeys};
use crate::signature::{self, AuthHeaderFields, HttpRequestData};
use crate::status::{self, ActivationStatusBlob, CounterSyncResult};
use crate::vault::{self, SignatureFormat};

/// The closed activation-lifecycle state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Invalid,
    Empty,
    Activation1,
    Activation2,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSignedKey {
    MasterServerKey,
    PersonalizedKey,
}

struct ProtocolUpgradeState {
    target_version: DataVersion,
    ctr_data: Option<[u8; 16]>,
}

struct SessionInner {
    setup: Option<SessionSetup>,
    ad: Option<ActivationData>,
    pd: Option<PersistentData>,
    upgrade: Option<ProtocolUpgradeState>,
    invalid: bool,
}

impl SessionInner {
    fn state(&self) -> State {
        if self.invalid {
            return State::Invalid;
        }
        if self.pd.is_some() {
            return State::Activated;
        }
        match &self.ad {
            None => State::Empty,
            Some(ad) if ad.activation_id.is_none() => State::Activation1,
            Some(_) => State::Activation2,
        }
    }

    fn setup(&self) -> Result<&SessionSetup> {
        self.setup.as_ref().ok_or_else(|| PowerAuthError::wrong_state("session is in the Invalid state"))
    }

    fn pd(&self) -> Result<&PersistentData> {
        self.pd.as_ref().ok_or_else(|| PowerAuthError::wrong_state("no activated session"))
    }

    fn pd_mut(&mut self) -> Result<&mut PersistentData> {
        self.pd.as_mut().ok_or_else(|| PowerAuthError::wrong_state("no activated session"))
    }
}

/// Fill in the password salt/iterations the session already persists so
/// callers only need to supply the password bytes itself.
fn effective_unlock_keys(pd: &PersistentData, unlock_keys: &UnlockKeys) -> UnlockKeys {
    UnlockKeys {
        possession_unlock_key: unlock_keys.possession_unlock_key,
        biometry_unlock_key: unlock_keys.biometry_unlock_key,
        password: unlock_keys.password.clone(),
        password_salt: Some(pd.password_salt),
        password_iterations: pd.password_iterations,
    }
}

/// The session object. Every public method acquires the internal re-entrant
/// lock before touching state, so a method may safely call another method
/// on `self` (e.g. signing internally re-derives unlock keys).
pub struct Session {
    inner: ReentrantMutex<RefCell<SessionInner>>,
}

impl Session {
    /// Construct a session from its immutable configuration. A setup that
    /// fails validation puts the session into the terminal `Invalid` state
    /// rather than returning an error, per the state machine's only
    /// non-recoverable entry point.
    pub fn new(setup: SessionSetup) -> Self {
        let invalid = setup.validate().is_err();
        if invalid {
            warn!("session setup failed validation, entering Invalid state");
        }
        let inner = SessionInner {
            setup: if invalid { None } else { Some(setup) },
            ad: None,
            pd: None,
            upgrade: None,
            invalid,
        };
        Session {
            inner: ReentrantMutex::new(RefCell::new(inner)),
        }
    }

    pub fn state(&self) -> State {
        let guard = self.inner.lock();
        guard.borrow().state()
    }

    pub fn has_valid_activation(&self) -> bool {
        self.state() == State::Activated
    }

    pub fn can_start_activation(&self) -> bool {
        self.state() == State::Empty
    }

    pub fn activation_identifier(&self) -> Option<String> {
        let guard = self.inner.lock();
        guard.borrow().pd.as_ref().map(|pd| pd.activation_id.clone())
    }

    pub fn has_biometry_factor(&self) -> bool {
        let guard = self.inner.lock();
        guard.borrow().pd.as_ref().map(|pd| pd.keys.has_biometry()).unwrap_or(false)
    }

    pub fn has_pending_protocol_upgrade(&self) -> bool {
        let guard = self.inner.lock();
        let b = guard.borrow();
        b.upgrade.is_some() || b.pd.as_ref().map(|pd| pd.pending_upgrade_version != 0).unwrap_or(false)
    }

    /// Reset an in-progress activation back to `Empty`. Has no effect on an
    /// already-`Activated` session.
    pub fn reset_activation(&self) {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        if b.pd.is_none() {
            b.ad = None;
        }
    }

    // ---- Activation handshake ----------------------------------------

    pub fn start_activation(&self, code: Option<&str>, signature: Option<&[u8]>) -> Result<String> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        if b.state() != State::Empty {
            return Err(PowerAuthError::wrong_state("start_activation requires state Empty"));
        }
        let setup = b.setup()?.clone();
        match activation::start_activation(&setup, code, signature) {
            Ok((ad, device_pub_b64)) => {
                b.ad = Some(ad);
                debug!(state = "Activation1", "activation started");
                Ok(device_pub_b64)
            }
            Err(e) => Err(e),
        }
    }

    pub fn validate_activation_response(&self, server_public_key: &[u8; 33], activation_id: &str, ctr_data_b64: &str, recovery: Option<RecoveryData>) -> Result<String> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        if b.state() != State::Activation1 {
            return Err(PowerAuthError::wrong_state("validate_activation_response requires state Activation1"));
        }
        let setup = b.setup()?.clone();
        let ad = b.ad.as_mut().expect("Activation1 implies ad is present");
        match activation::validate_activation_response(&setup, ad, server_public_key, activation_id, ctr_data_b64, recovery) {
            Ok(fingerprint) => {
                debug!(state = "Activation2", "activation response validated");
                Ok(fingerprint)
            }
            Err(e) => {
                if matches!(e, PowerAuthError::Encryption(_)) {
                    warn!("activation response decryption failed, resetting activation");
                    b.ad = None;
                }
                Err(e)
            }
        }
    }

    pub fn complete_activation(&self, unlock_keys: &UnlockKeys) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        if b.state() != State::Activation2 {
            return Err(PowerAuthError::wrong_state("complete_activation requires state Activation2"));
        }
        let setup = b.setup()?.clone();
        let ad = b.ad.take().expect("Activation2 implies ad is present");

        let completed: CompletedActivation = match activation::complete_activation(&setup, &ad, unlock_keys) {
            Ok(c) => c,
            Err(e) => {
                return Err(e);
            }
        };

        let pd = PersistentData {
            version: DataVersion::V3_1,
            activation_id: completed.activation_id,
            legacy_counter: 0,
            signature_counter_data: completed.ctr_data,
            has_signature_counter_byte: true,
            signature_counter_byte: 0,
            password_iterations: 10_000,
            password_salt: completed.password_salt,
            keys: completed.keys,
            server_public_key: completed.server_public_key,
            device_public_key: completed.device_public_key,
            c_device_private_key: completed.c_device_private_key,
            c_recovery_data: completed.c_recovery_data,
            pending_upgrade_version: 0,
            waiting_for_vault_unlock: false,
        };
        pd.validate()?;
        b.pd = Some(pd);
        debug!(state = "Activated", "activation completed");
        Ok(())
    }

    // ---- Signing -------------------------------------------------------

    pub fn sign_http_request(&self, request: &HttpRequestData, unlock_keys: &UnlockKeys, factor: SignatureFactor) -> Result<(String, String)> {
        request.validate()?;
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let offline = request.offline_nonce.is_some();
        if offline && (b.upgrade.is_some() || b.pd.as_ref().map(|pd| pd.pending_upgrade_version != 0).unwrap_or(false)) {
            warn!("rejected offline signature while a protocol upgrade is pending");
            return Err(PowerAuthError::wrong_state("offline signing is forbidden while a protocol upgrade is pending"));
        }
        let setup = b.setup()?.clone();
        let pd = b.pd_mut()?;

        let unlock_keys = effective_unlock_keys(pd, unlock_keys);
        let derived = keys::unlock(
            &pd.keys,
            &unlock_keys,
            &LockRequest {
                factor,
                ext_key: setup.external_encryption_key.as_ref(),
            },
        )?;

        let nonce: Vec<u8> = match request.offline_nonce {
            Some(n) => n.to_vec(),
            None => crypto::random_bytes(16),
        };
        let app_secret: &[u8] = if offline { b"offline" } else { &setup.application_secret };
        let norm = signature::normalize(request.method, request.uri, &nonce, request.body, app_secret, offline);

        let signature_value = if let Some(len) = request.offline_signature_length {
            signature::calculate_offline_signature(&pd.signature_counter_data, &derived, factor, &norm, len)?
        } else {
            signature::calculate_online_signature(&pd.signature_counter_data, &derived, factor, &norm)?
        };

        pd.signature_counter_data = signature::advance_counter(&pd.signature_counter_data)?;
        pd.signature_counter_byte = pd.signature_counter_byte.wrapping_add(1);

        let version_str = if pd.version == DataVersion::V2 { "2.1" } else { "3.1" };
        let header = signature::format_auth_header(&AuthHeaderFields {
            version: version_str,
            activation_id: &pd.activation_id,
            application_key: &B64.encode(setup.application_key),
            nonce_b64: &B64.encode(&nonce),
            signature_type: signature::factor_type_string(factor)?,
            signature: &signature_value,
        });
        Ok((signature_value, header))
    }

    // ---- Status decode / counter sync ----------------------------------

    pub fn decode_activation_status(&self, challenge: &[u8; 16], nonce: &[u8; 16], encrypted_status_blob: &[u8; 32], unlock_keys: &UnlockKeys) -> Result<(ActivationStatusBlob, CounterSyncResult)> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let setup = b.setup()?.clone();
        let pd = b.pd_mut()?;

        let derived = keys::unlock(
            &pd.keys,
            unlock_keys,
            &LockRequest {
                factor: SignatureFactor::TRANSPORT,
                ext_key: setup.external_encryption_key.as_ref(),
            },
        )?;
        let blob = status::decrypt_status_blob(&derived.transport, challenge, nonce, encrypted_status_blob)?;
        let outcome = status::synchronize_counter(&pd.signature_counter_data, pd.signature_counter_byte, pd.has_signature_counter_byte, &blob)?;
        debug!(result = ?outcome.result, "counter resynchronized against status blob");
        if let Some(new_ctr) = outcome.new_signature_counter_data {
            pd.signature_counter_data = new_ctr;
        }
        if let Some(new_byte) = outcome.new_signature_counter_byte {
            pd.signature_counter_byte = new_byte;
            pd.has_signature_counter_byte = true;
        }
        Ok((blob, outcome.result))
    }

    // ---- Vault operations ------------------------------------------------

    pub fn change_password(&self, old: &[u8], new: &[u8]) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let pd = b.pd_mut()?;
        let old_salt = pd.password_salt;
        let old_iterations = pd.password_iterations;
        let new_salt = vault::change_password(&mut pd.keys, old, &old_salt, old_iterations, new, old_iterations)?;
        pd.password_salt = new_salt;
        Ok(())
    }

    pub fn add_biometry_factor(&self, c_vault: &[u8], unlock_keys: &UnlockKeys, biometry_unlock_key: &[u8; 16]) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let pd = b.pd_mut()?;
        let server_public_key = crypto::import_public_key(&pd.server_public_key)?;
        let c_device_private_key = pd.c_device_private_key.clone();
        vault::add_biometry_factor(c_vault, &mut pd.keys, unlock_keys, &c_device_private_key, &server_public_key, biometry_unlock_key)
    }

    pub fn remove_biometry_factor(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let pd = b.pd_mut()?;
        vault::remove_biometry_factor(&mut pd.keys);
        Ok(())
    }

    fn vault_key(&self, b: &SessionInner, c_vault: &[u8], unlock_keys: &UnlockKeys) -> Result<[u8; 16]> {
        let pd = b.pd()?;
        vault::decrypt_vault_key(c_vault, &pd.keys, unlock_keys)
    }

    pub fn derive_cryptographic_key(&self, c_vault: &[u8], unlock_keys: &UnlockKeys, index: u64) -> Result<[u8; 16]> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        let vault_key = self.vault_key(&b, c_vault, unlock_keys)?;
        vault::derive_cryptographic_key(&vault_key, index)
    }

    pub fn sign_with_device_private_key(&self, c_vault: &[u8], unlock_keys: &UnlockKeys, data: &[u8], format: SignatureFormat) -> Result<Vec<u8>> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        let vault_key = self.vault_key(&b, c_vault, unlock_keys)?;
        let pd = b.pd()?;
        vault::sign_with_device_private_key(&vault_key, &pd.c_device_private_key, data, format)
    }

    pub fn get_activation_recovery_data(&self, c_vault: &[u8], unlock_keys: &UnlockKeys) -> Result<(String, String)> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        let vault_key = self.vault_key(&b, c_vault, unlock_keys)?;
        let pd = b.pd()?;
        vault::get_activation_recovery_data(&vault_key, &pd.c_recovery_data)
    }

    // ---- ECIES -----------------------------------------------------------

    pub fn get_ecies_encryptor_application_scope(&self) -> Result<EciesEncryptor> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        let setup = b.setup()?;
        ecies::get_ecies_encryptor(EciesScope::Application { app_secret: &setup.application_secret }, &setup.master_server_public_key)
    }

    pub fn get_ecies_encryptor_activation_scope(&self, unlock_keys: &UnlockKeys) -> Result<EciesEncryptor> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        let setup = b.setup()?;
        let pd = b.pd()?;
        let derived = keys::unlock(
            &pd.keys,
            unlock_keys,
            &LockRequest {
                factor: SignatureFactor::TRANSPORT,
                ext_key: setup.external_encryption_key.as_ref(),
            },
        )?;
        ecies::get_ecies_encryptor(
            EciesScope::Activation {
                app_secret: &setup.application_secret,
                transport_key: &derived.transport,
            },
            &pd.server_public_key,
        )
    }

    // ---- Server-signed data verification ---------------------------------

    pub fn verify_server_signed_data(&self, data: &[u8], signature: &[u8], key: ServerSignedKey, format: SignatureFormat) -> Result<bool> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        let public_key_bytes = match key {
            ServerSignedKey::MasterServerKey => b.setup()?.master_server_public_key,
            ServerSignedKey::PersonalizedKey => b.pd()?.server_public_key,
        };
        let public_key = crypto::import_public_key(&public_key_bytes)?;
        let der_sig = match format {
            SignatureFormat::Der => signature.to_vec(),
            SignatureFormat::Jose => {
                let jose: [u8; 64] = signature.try_into().map_err(|_| PowerAuthError::wrong_param("JOSE signature must be 64 bytes"))?;
                crypto::jose_to_der(&jose)?
            }
        };
        crypto::ecdsa_verify(data, &der_sig, &public_key)
    }

    // ---- Protocol upgrade sub-state machine ------------------------------

    pub fn start_protocol_upgrade(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        if b.upgrade.is_some() {
            return Err(PowerAuthError::wrong_state("protocol upgrade already in progress"));
        }
        let pd = b.pd()?;
        if pd.version >= DataVersion::V3NoCtrByte {
            return Err(PowerAuthError::wrong_state("activation is already on the current protocol version"));
        }
        b.upgrade = Some(ProtocolUpgradeState {
            target_version: DataVersion::V3NoCtrByte,
            ctr_data: None,
        });
        b.pd_mut()?.pending_upgrade_version = DataVersion::V3NoCtrByte as u8;
        debug!("protocol upgrade started");
        Ok(())
    }

    pub fn apply_protocol_upgrade_data(&self, to_v3_ctr_data_b64: &str) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let ctr_data = B64.decode(to_v3_ctr_data_b64).map_err(|_| PowerAuthError::encryption("invalid base64 upgrade ctrData"))?;
        if ctr_data.len() != 16 {
            return Err(PowerAuthError::wrong_param("upgrade ctrData must decode to 16 bytes"));
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&ctr_data);
        let upgrade = b.upgrade.as_mut().ok_or_else(|| PowerAuthError::wrong_state("no protocol upgrade in progress"))?;
        upgrade.ctr_data = Some(arr);
        Ok(())
    }

    pub fn finish_protocol_upgrade(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        let upgrade = b.upgrade.take().ok_or_else(|| PowerAuthError::wrong_state("no protocol upgrade in progress"))?;
        let ctr_data = upgrade
            .ctr_data
            .ok_or_else(|| PowerAuthError::wrong_state("apply_protocol_upgrade_data was never called"))?;
        let target_version = upgrade.target_version;
        let pd = b.pd_mut()?;
        pd.version = target_version;
        pd.signature_counter_data = ctr_data;
        pd.has_signature_counter_byte = false;
        pd.signature_counter_byte = 0;
        pd.pending_upgrade_version = 0;
        debug!(version = ?target_version, "protocol upgrade finished");
        Ok(())
    }

    // ---- Persistence -------------------------------------------------------

    pub fn save_session_state(&self) -> Vec<u8> {
        let guard = self.inner.lock();
        let b = guard.borrow();
        codec::serialize_session_state(b.pd.as_ref())
    }

    pub fn load_session_state(&self, data: &[u8]) -> Result<()> {
        let pd = codec::deserialize_session_state(data)?;
        let guard = self.inner.lock();
        let mut b = guard.borrow_mut();
        b.ad = None;
        b.pd = pd;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::HttpMethod;

    fn sample_setup() -> SessionSetup {
        let master = crypto::generate_key_pair();
        SessionSetup {
            application_key: [1u8; 16],
            application_secret: [2u8; 16],
            master_server_public_key: crypto::export_public_key(&master.public),
            session_identifier: 1,
            external_encryption_key: None,
        }
    }

    fn sample_unlock_keys() -> UnlockKeys {
        UnlockKeys {
            possession_unlock_key: Some([1u8; 16]),
            biometry_unlock_key: Some([2u8; 16]),
            password: Some(b"password".to_vec()),
            password_salt: None,
            password_iterations: 10_000,
        }
    }

    fn activated_session() -> (Session, UnlockKeys) {
        let setup = sample_setup();
        let session = Session::new(setup);
        assert_eq!(session.state(), State::Empty);

        let _device_pub = session.start_activation(None, None).unwrap();
        assert_eq!(session.state(), State::Activation1);

        let server_kp = crypto::generate_key_pair();
        let server_pub = crypto::export_public_key(&server_kp.public);
        let ctr_data = crypto::random_bytes(16);
        let ctr_b64 = B64.encode(&ctr_data);
        session
            .validate_activation_response(&server_pub, "ED7BA470-8E54-465E-825C-99712043E01C", &ctr_b64, None)
            .unwrap();
        assert_eq!(session.state(), State::Activation2);

        let unlock_keys = sample_unlock_keys();
        session.complete_activation(&unlock_keys).unwrap();
        assert_eq!(session.state(), State::Activated);
        (session, unlock_keys)
    }

    #[test]
    fn invalid_setup_enters_invalid_state() {
        let mut setup = sample_setup();
        setup.master_server_public_key = [0u8; 33];
        let session = Session::new(setup);
        assert_eq!(session.state(), State::Invalid);
    }

    #[test]
    fn s1_activation_happy_path() {
        let (session, _unlock) = activated_session();
        assert!(session.has_valid_activation());
        assert_eq!(session.activation_identifier().unwrap(), "ED7BA470-8E54-465E-825C-99712043E01C");
        assert!(session.has_biometry_factor());
    }

    #[test]
    fn s2_sign_http_request_possession_knowledge_biometry() {
        let (session, unlock_keys) = activated_session();
        let request = HttpRequestData {
            method: HttpMethod::Post,
            uri: "/user/login",
            body: b"",
            offline_nonce: None,
            offline_signature_length: None,
        };
        let factor = SignatureFactor::POSSESSION | SignatureFactor::KNOWLEDGE | SignatureFactor::BIOMETRY;
        let (sig, header) = session.sign_http_request(&request, &unlock_keys, factor).unwrap();
        assert_eq!(sig.len(), 64);
        assert!(header.contains("pa_version=\"3.1\""));
        assert!(header.contains("pa_signature_type=\"possession_knowledge_biometry\""));
    }

    #[test]
    fn signing_advances_counter_exactly_once() {
        let (session, unlock_keys) = activated_session();
        let request = HttpRequestData {
            method: HttpMethod::Get,
            uri: "/status",
            body: b"",
            offline_nonce: None,
            offline_signature_length: None,
        };
        let ctr_before = {
            let guard = session.inner.lock();
            guard.borrow().pd.as_ref().unwrap().signature_counter_data
        };
        session.sign_http_request(&request, &unlock_keys, SignatureFactor::POSSESSION).unwrap();
        let ctr_after = {
            let guard = session.inner.lock();
            guard.borrow().pd.as_ref().unwrap().signature_counter_data
        };
        assert_ne!(ctr_before, ctr_after);
    }

    #[test]
    fn s3_password_change_then_sign_with_new_password() {
        let (session, unlock_keys) = activated_session();
        session.change_password(b"password", b"nbusr123").unwrap();

        let new_unlock = UnlockKeys {
            possession_unlock_key: unlock_keys.possession_unlock_key,
            biometry_unlock_key: unlock_keys.biometry_unlock_key,
            password: Some(b"nbusr123".to_vec()),
            password_salt: None,
            password_iterations: 10_000,
        };

        let request = HttpRequestData {
            method: HttpMethod::Post,
            uri: "/secure/op",
            body: b"",
            offline_nonce: None,
            offline_signature_length: None,
        };
        let result = session.sign_http_request(&request, &new_unlock, SignatureFactor::POSSESSION | SignatureFactor::KNOWLEDGE);
        assert!(result.is_ok());

        let old_result = session.sign_http_request(&request, &unlock_keys, SignatureFactor::POSSESSION | SignatureFactor::KNOWLEDGE);
        assert!(old_result.is_err());
    }

    #[test]
    fn s4_status_deadlock_updates_nothing_and_reports_invalid() {
        let (session, unlock_keys) = activated_session();
        let (ctr_before, transport_key) = {
            let guard = session.inner.lock();
            let b = guard.borrow();
            let pd = b.pd.as_ref().unwrap();
            let derived = keys::unlock(
                &pd.keys,
                &unlock_keys,
                &LockRequest {
                    factor: SignatureFactor::TRANSPORT,
                    ext_key: None,
                },
            )
            .unwrap();
            (pd.signature_counter_data, derived.transport)
        };

        let mut server_hash = ctr_before;
        for _ in 0..80 {
            server_hash = signature::advance_counter(&server_hash).unwrap();
        }
        let challenge = [1u8; 16];
        let nonce = [2u8; 16];

        // Build an encrypted blob whose decrypted contents carry the S4 shape.
        let mut plain = [0u8; 32];
        plain[0..4].copy_from_slice(&[0xDE, 0xC0, 0xDE, 0xD1]);
        plain[4] = 3; // Active
        plain[5] = 3;
        plain[10] = 20; // look_ahead
        plain[11] = 80; // server_ctr_byte = local(0) + 80, far past look_ahead
        plain[12..28].copy_from_slice(&server_hash);

        let zero_iv = [0u8; 16];
        let mut index_block = [0u8; 16];
        index_block[8..].copy_from_slice(&3000u64.to_be_bytes());
        let derived_index_key = crypto::aes_cbc_encrypt(&transport_key, &zero_iv, &index_block).unwrap();
        let mut derived_index = [0u8; 16];
        derived_index.copy_from_slice(&derived_index_key[..16]);
        let mac = crypto::hmac_sha256_full(&challenge, &derived_index);
        let reduced = crypto::reduce_shared_secret(&mac).unwrap();
        let mut iv = [0u8; 16];
        for i in 0..16 {
            iv[i] = reduced[i] ^ nonce[i];
        }
        let encrypted = crypto::aes_cbc_encrypt(&transport_key, &iv, &plain).unwrap();
        let mut encrypted_blob = [0u8; 32];
        encrypted_blob.copy_from_slice(&encrypted);

        let (_blob, result) = session.decode_activation_status(&challenge, &nonce, &encrypted_blob, &unlock_keys).unwrap();
        assert_eq!(result, CounterSyncResult::Invalid);
    }

    #[test]
    fn get_ecies_encryptor_application_scope_round_trips_with_manual_decryptor() {
        let setup = sample_setup();
        let master_private = crypto::generate_key_pair();
        let mut setup_with_known_master = setup;
        setup_with_known_master.master_server_public_key = crypto::export_public_key(&master_private.public);
        let session = Session::new(setup_with_known_master);

        let mut encryptor = session.get_ecies_encryptor_application_scope().unwrap();
        let request = encryptor.encrypt_request(b"Hello!", b"/pa/test", b"", 1).unwrap();

        let mut decryptor = ecies::get_ecies_decryptor(EciesScope::Application { app_secret: &[2u8; 16] }, master_private.private.clone());
        let recovered = decryptor.decrypt_request(&request, b"/pa/test", b"", 1).unwrap();
        assert_eq!(recovered, b"Hello!");
    }

    #[test]
    fn verify_server_signed_data_master_key_der_and_jose() {
        let master = crypto::generate_key_pair();
        let mut setup = sample_setup();
        setup.master_server_public_key = crypto::export_public_key(&master.public);
        let session = Session::new(setup);

        let der_sig = crypto::ecdsa_sign(b"server says hi", &master.private).unwrap();
        assert!(session
            .verify_server_signed_data(b"server says hi", &der_sig, ServerSignedKey::MasterServerKey, SignatureFormat::Der)
            .unwrap());

        let jose_sig = crypto::der_to_jose(&der_sig).unwrap();
        assert!(session
            .verify_server_signed_data(b"server says hi", &jose_sig, ServerSignedKey::MasterServerKey, SignatureFormat::Jose)
            .unwrap());
    }

    #[test]
    fn s6_protocol_upgrade_from_v2_clears_counter_byte_flag() {
        let (session, _unlock_keys) = activated_session();
        {
            let guard = session.inner.lock();
            let mut b = guard.borrow_mut();
            b.pd.as_mut().unwrap().version = DataVersion::V2;
        }
        assert!(!session.has_pending_protocol_upgrade());

        session.start_protocol_upgrade().unwrap();
        assert!(session.has_pending_protocol_upgrade());

        let new_ctr = crypto::random_bytes(16);
        session.apply_protocol_upgrade_data(&B64.encode(&new_ctr)).unwrap();
        session.finish_protocol_upgrade().unwrap();

        assert!(!session.has_pending_protocol_upgrade());
        let guard = session.inner.lock();
        let b = guard.borrow();
        let pd = b.pd.as_ref().unwrap();
        assert_eq!(pd.version, DataVersion::V3NoCtrByte);
        assert!(!pd.has_signature_counter_byte);
    }

    #[test]
    fn save_and_load_session_state_roundtrips() {
        let (session, _unlock_keys) = activated_session();
        let saved = session.save_session_state();

        let setup2 = sample_setup();
        let session2 = Session::new(setup2);
        session2.load_session_state(&saved).unwrap();
        assert_eq!(session2.activation_identifier(), session.activation_identifier());
    }
}
