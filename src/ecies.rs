//! ECIES envelope encryption: key derivation, per-message cryptograms, and
//! the single-use request/response envelope lifecycle.

use subtle::ConstantTimeEq;

use crate::crypto::{self, KeyPair};
use crate::error::{PowerAuthError, Result};

const PROTOCOL_VERSION: &[u8] = b"3.1";

/// The three 16-byte keys split out of the X9.63 KDF material.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct EnvelopeKey {
    enc_key: [u8; 16],
    mac_key: [u8; 16],
    iv_key: [u8; 16],
}

fn derive_envelope_key(shared_secret: &[u8; 32], shared_info1: &[u8], ephemeral_pub_compressed: &[u8; 33]) -> EnvelopeKey {
    let mut info = Vec::with_capacity(PROTOCOL_VERSION.len() + shared_info1.len() + 33);
    info.extend_from_slice(PROTOCOL_VERSION);
    info.extend_from_slice(shared_info1);
    info.extend_from_slice(ephemeral_pub_compressed);
    let material = crypto::ecdh_kdf_x963_sha256(shared_secret, &info, 48);

    let mut enc_key = [0u8; 16];
    let mut mac_key = [0u8; 16];
    let mut iv_key = [0u8; 16];
    enc_key.copy_from_slice(&material[0..16]);
    mac_key.copy_from_slice(&material[16..32]);
    iv_key.copy_from_slice(&material[32..48]);
    EnvelopeKey { enc_key, mac_key, iv_key }
}

/// `KDF_INTERNAL(key, idx) = XOR_halves(HMAC_SHA256(key, idx))`.
fn derive_internal_iv(iv_key: &[u8; 16], nonce: &[u8; 16]) -> [u8; 16] {
    crypto::xor_halves(&crypto::hmac_sha256_full(iv_key, nonce))
}

/// An encrypted ECIES message: ciphertext body, MAC, optional embedded
/// ephemeral public key (present only on the request direction), and nonce.
#[derive(Debug, Clone)]
pub struct Cryptogram {
    pub body: Vec<u8>,
    pub mac: [u8; 32],
    pub key: Option<[u8; 33]>,
    pub nonce: [u8; 16],
}

fn mac_input(body: &[u8], shared_info2: &[u8], nonce: &[u8; 16], timestamp: u64, ephemeral_key: &[u8; 33], associated_data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + shared_info2.len() + 16 + 8 + 33 + associated_data.len());
    out.extend_from_slice(body);
    out.extend_from_slice(shared_info2);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(ephemeral_key);
    out.extend_from_slice(associated_data);
    out
}

fn encrypt_with_envelope(
    envelope: &EnvelopeKey,
    plaintext: &[u8],
    nonce: &[u8; 16],
    shared_info2: &[u8],
    timestamp: u64,
    ephemeral_key: &[u8; 33],
    associated_data: &[u8],
    include_key: bool,
) -> Result<Cryptogram> {
    let iv = derive_internal_iv(&envelope.iv_key, nonce);
    let body = crypto::aes_cbc_encrypt_pkcs7(&envelope.enc_key, &iv, plaintext)?;
    let input = mac_input(&body, shared_info2, nonce, timestamp, ephemeral_key, associated_data);
    let mac = crypto::hmac_sha256_full(&envelope.mac_key, &input);
    Ok(Cryptogram {
        body,
        mac,
        key: if include_key { Some(*ephemeral_key) } else { None },
        nonce: *nonce,
    })
}

fn decrypt_with_envelope(envelope: &EnvelopeKey, cryptogram: &Cryptogram, shared_info2: &[u8], timestamp: u64, ephemeral_key: &[u8; 33], associated_data: &[u8]) -> Result<Vec<u8>> {
    let input = mac_input(&cryptogram.body, shared_info2, &cryptogram.nonce, timestamp, ephemeral_key, associated_data);
    let expected_mac = crypto::hmac_sha256_full(&envelope.mac_key, &input);
    if expected_mac.ct_eq(&cryptogram.mac).unwrap_u8() != 1 {
        return Err(PowerAuthError::encryption("ECIES MAC verification failed"));
    }
    let iv = derive_internal_iv(&envelope.iv_key, &cryptogram.nonce);
    crypto::aes_cbc_decrypt_pkcs7(&envelope.enc_key, &iv, &cryptogram.body)
}

/// Which static server key and `sharedInfo2` an envelope binds to.
pub enum EciesScope<'a> {
    /// No activation required; keyed by the application's master server key.
    Application { app_secret: &'a [u8; 16] },
    /// Requires an activated session; keyed by the server's per-activation key.
    Activation { app_secret: &'a [u8; 16], transport_key: &'a [u8; 16] },
}

impl<'a> EciesScope<'a> {
    fn shared_info2(&self) -> Vec<u8> {
        match self {
            EciesScope::Application { app_secret } => crypto::sha256(app_secret.as_slice()).to_vec(),
            EciesScope::Activation { app_secret, transport_key } => crypto::hmac_sha256_full(app_secret.as_slice(), transport_key.as_slice()).to_vec(),
        }
    }
}

/// The client-side (requester) half of an ECIES exchange: encrypts a
/// request under a fresh ephemeral key, then decrypts exactly one response
/// with the same envelope before it is invalidated.
pub struct EciesEncryptor {
    server_public_key: p256::PublicKey,
    shared_info2: Vec<u8>,
    pending: Option<(EnvelopeKey, [u8; 33])>,
}

/// `get_ecies_encryptor`: build an encryptor bound to the given scope.
pub fn get_ecies_encryptor(scope: EciesScope, server_public_key_bytes: &[u8; 33]) -> Result<EciesEncryptor> {
    let server_public_key = crypto::import_public_key(server_public_key_bytes)?;
    Ok(EciesEncryptor {
        server_public_key,
        shared_info2: scope.shared_info2(),
        pending: None,
    })
}

impl EciesEncryptor {
    /// Encrypt a request under a freshly generated ephemeral key. The
    /// returned cryptogram's `key` field is always populated so the
    /// responder can derive the same envelope.
    pub fn encrypt_request(&mut self, plaintext: &[u8], shared_info1: &[u8], associated_data: &[u8], timestamp: u64) -> Result<Cryptogram> {
        let ephemeral: KeyPair = crypto::generate_key_pair();
        let ephemeral_pub = crypto::export_public_key(&ephemeral.public);
        let shared = crypto::ecdh_raw(&ephemeral.private, &self.server_public_key)?;
        let envelope = derive_envelope_key(&shared, shared_info1, &ephemeral_pub);

        let nonce_vec = crypto::random_bytes(16);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&nonce_vec);

        let cryptogram = encrypt_with_envelope(&envelope, plaintext, &nonce, &self.shared_info2, timestamp, &ephemeral_pub, associated_data, true)?;
        self.pending = Some((envelope, ephemeral_pub));
        Ok(cryptogram)
    }

    /// Decrypt the single response that corresponds to the last
    /// `encrypt_request` call. The envelope is consumed: a second call
    /// without an intervening `encrypt_request` fails with `WrongState`.
    pub fn decrypt_response(&mut self, cryptogram: &Cryptogram, associated_data: &[u8], timestamp: u64) -> Result<Vec<u8>> {
        let (envelope, ephemeral_pub) = self
            .pending
            .take()
            .ok_or_else(|| PowerAuthError::wrong_state("decrypt_response called with no pending request envelope"))?;
        decrypt_with_envelope(&envelope, cryptogram, &self.shared_info2, timestamp, &ephemeral_pub, associated_data)
    }

    pub fn has_pending_envelope(&self) -> bool {
        self.pending.is_some()
    }
}

/// The server-side (responder) half: derives the envelope from an incoming
/// request's embedded ephemeral key, decrypts it, and caches the envelope to
/// encrypt exactly one response.
pub struct EciesDecryptor {
    static_private_key: p256::SecretKey,
    shared_info2: Vec<u8>,
    cached: Option<(EnvelopeKey, [u8; 33])>,
}

pub fn get_ecies_decryptor(scope: EciesScope, static_private_key: p256::SecretKey) -> EciesDecryptor {
    EciesDecryptor {
        static_private_key,
        shared_info2: scope.shared_info2(),
        cached: None,
    }
}

impl EciesDecryptor {
    pub fn decrypt_request(&mut self, cryptogram: &Cryptogram, shared_info1: &[u8], associated_data: &[u8], timestamp: u64) -> Result<Vec<u8>> {
        let ephemeral_pub_bytes = cryptogram.key.ok_or_else(|| PowerAuthError::wrong_param("request cryptogram is missing its ephemeral key"))?;
        let ephemeral_pub = crypto::import_public_key(&ephemeral_pub_bytes)?;
        let shared = crypto::ecdh_raw(&self.static_private_key, &ephemeral_pub)?;
        let envelope = derive_envelope_key(&shared, shared_info1, &ephemeral_pub_bytes);
        let plain = decrypt_with_envelope(&envelope, cryptogram, &self.shared_info2, timestamp, &ephemeral_pub_bytes, associated_data)?;
        self.cached = Some((envelope, ephemeral_pub_bytes));
        Ok(plain)
    }

    /// Encrypt the single response corresponding to the last
    /// `decrypt_request` call, consuming the cached envelope.
    pub fn encrypt_response(&mut self, plaintext: &[u8], associated_data: &[u8], timestamp: u64) -> Result<Cryptogram> {
        let (envelope, ephemeral_pub) = self
            .cached
            .take()
            .ok_or_else(|| PowerAuthError::wrong_state("encrypt_response called with no cached request envelope"))?;
        let nonce_vec = crypto::random_bytes(16);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&nonce_vec);
        encrypt_with_envelope(&envelope, plaintext, &nonce, &self.shared_info2, timestamp, &ephemeral_pub, associated_data, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_scope_request_response_roundtrip() {
        let server_kp = crypto::generate_key_pair();
        let server_pub_bytes = crypto::export_public_key(&server_kp.public);
        let app_secret = [9u8; 16];

        let mut encryptor = get_ecies_encryptor(EciesScope::Application { app_secret: &app_secret }, &server_pub_bytes).unwrap();
        let request = encryptor.encrypt_request(b"hello server", b"/activation/create", b"", 1_700_000_000).unwrap();
        assert!(request.key.is_some());

        let mut decryptor = get_ecies_decryptor(EciesScope::Application { app_secret: &app_secret }, server_kp.private.clone());
        let recovered_request = decryptor.decrypt_request(&request, b"/activation/create", b"", 1_700_000_000).unwrap();
        assert_eq!(recovered_request, b"hello server");

        let response = decryptor.encrypt_response(b"hello client", b"", 1_700_000_001).unwrap();
        assert!(response.key.is_none());

        let recovered_response = encryptor.decrypt_response(&response, b"", 1_700_000_001).unwrap();
        assert_eq!(recovered_response, b"hello client");
    }

    #[test]
    fn activation_scope_uses_transport_key_bound_shared_info2() {
        let server_kp = crypto::generate_key_pair();
        let server_pub_bytes = crypto::export_public_key(&server_kp.public);
        let app_secret = [1u8; 16];
        let transport_key = [2u8; 16];

        let mut encryptor = get_ecies_encryptor(
            EciesScope::Activation {
                app_secret: &app_secret,
                transport_key: &transport_key,
            },
            &server_pub_bytes,
        )
        .unwrap();
        let request = encryptor.encrypt_request(b"signed payload", b"/secure/op", b"", 1).unwrap();

        let mut decryptor = get_ecies_decryptor(
            EciesScope::Activation {
                app_secret: &app_secret,
                transport_key: &transport_key,
            },
            server_kp.private.clone(),
        );
        let recovered = decryptor.decrypt_request(&request, b"/secure/op", b"", 1).unwrap();
        assert_eq!(recovered, b"signed payload");
    }

    #[test]
    fn decrypt_response_without_pending_request_fails() {
        let server_kp = crypto::generate_key_pair();
        let server_pub_bytes = crypto::export_public_key(&server_kp.public);
        let app_secret = [3u8; 16];
        let mut encryptor = get_ecies_encryptor(EciesScope::Application { app_secret: &app_secret }, &server_pub_bytes).unwrap();
        let bogus = Cryptogram {
            body: vec![0u8; 16],
            mac: [0u8; 32],
            key: None,
            nonce: [0u8; 16],
        };
        assert!(encryptor.decrypt_response(&bogus, b"", 0).is_err());
    }

    #[test]
    fn response_envelope_is_single_use() {
        let server_kp = crypto::generate_key_pair();
        let server_pub_bytes = crypto::export_public_key(&server_kp.public);
        let app_secret = [4u8; 16];
        let mut encryptor = get_ecies_encryptor(EciesScope::Application { app_secret: &app_secret }, &server_pub_bytes).unwrap();
        let request = encryptor.encrypt_request(b"data", b"si1", b"", 5).unwrap();

        let mut decryptor = get_ecies_decryptor(EciesScope::Application { app_secret: &app_secret }, server_kp.private.clone());
        decryptor.decrypt_request(&request, b"si1", b"", 5).unwrap();
        let response = decryptor.encrypt_response(b"reply", b"", 6).unwrap();

        encryptor.decrypt_response(&response, b"", 6).unwrap();
        assert!(!encryptor.has_pending_envelope());
        assert!(encryptor.decrypt_response(&response, b"", 6).is_err());
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let server_kp = crypto::generate_key_pair();
        let server_pub_bytes = crypto::export_public_key(&server_kp.public);
        let app_secret = [5u8; 16];
        let mut encryptor = get_ecies_encryptor(EciesScope::Application { app_secret: &app_secret }, &server_pub_bytes).unwrap();
        let mut request = encryptor.encrypt_request(b"data", b"si1", b"", 7).unwrap();
        request.mac[0] ^= 1;

        let mut decryptor = get_ecies_decryptor(EciesScope::Application { app_secret: &app_secret }, server_kp.private.clone());
        assert!(decryptor.decrypt_request(&request, b"si1", b"", 7).is_err());
    }
}
