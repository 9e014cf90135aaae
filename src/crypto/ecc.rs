//! P-256 (secp256r1) key pairs, ECDH, ECDSA sign/verify, and DER/JOSE
//! signature conversion.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{AffinePoint, EncodedPoint, PublicKey, SecretKey};

use crate::error::{PowerAuthError, Result};

pub struct KeyPair {
    pub private: SecretKey,
    pub public: PublicKey,
}

pub fn generate_key_pair() -> KeyPair {
    let private = SecretKey::random(&mut rand_core::OsRng);
    let public = private.public_key();
    KeyPair { private, public }
}

/// Export a public key in SEC1 compressed form (33 bytes).
pub fn export_public_key(key: &PublicKey) -> [u8; 33] {
    let encoded = key.to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Import a compressed public key, rejecting points not on the curve and
/// the point at infinity.
pub fn import_public_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != 33 {
        return Err(PowerAuthError::wrong_param("public key must be 33 bytes (compressed)"));
    }
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|e| PowerAuthError::encryption(format!("invalid point encoding: {e}")))?;
    let key = PublicKey::from_encoded_point(&encoded);
    if key.is_none().into() {
        return Err(PowerAuthError::encryption("public key point is not on the curve or is the point at infinity"));
    }
    Ok(key.unwrap())
}

/// Export a private key as an unsigned big-endian 32-byte integer.
pub fn export_private_key(key: &SecretKey) -> [u8; 32] {
    key.to_bytes().into()
}

/// Import a private key from an unsigned big-endian 32-byte integer.
pub fn import_private_key(bytes: &[u8]) -> Result<SecretKey> {
    if bytes.len() != 32 {
        return Err(PowerAuthError::wrong_param("private key must be 32 bytes"));
    }
    SecretKey::from_slice(bytes).map_err(|e| PowerAuthError::encryption(format!("invalid private key: {e}")))
}

/// Raw ECDH: `private * public`, returning the 32-byte X coordinate of the
/// resulting point. Validates the key can actually agree before returning.
pub fn ecdh_raw(private: &SecretKey, public: &PublicKey) -> Result<[u8; 32]> {
    let shared = p256::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine());
    let bytes = shared.raw_secret_bytes();
    if bytes.iter().all(|b| *b == 0) {
        return Err(PowerAuthError::encryption("ECDH produced a degenerate shared secret"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes.as_slice());
    Ok(out)
}

/// Affine X coordinate of a public key as an unsigned big-endian integer
/// with leading zero bytes stripped (used by the activation fingerprint).
pub fn affine_x_stripped(key: &PublicKey) -> Vec<u8> {
    let encoded = key.to_encoded_point(false);
    let x = encoded.x().expect("uncompressed point always has an X coordinate");
    let mut i = 0;
    while i < x.len() - 1 && x[i] == 0 {
        i += 1;
    }
    x[i..].to_vec()
}

pub fn ecdsa_sign(msg: &[u8], private: &SecretKey) -> Result<Vec<u8>> {
    let signing_key = SigningKey::from(private);
    let sig: Signature = signing_key
        .try_sign(msg)
        .map_err(|e| PowerAuthError::encryption(format!("ecdsa sign: {e}")))?;
    Ok(sig.to_der().as_bytes().to_vec())
}

pub fn ecdsa_verify(msg: &[u8], der_sig: &[u8], public: &PublicKey) -> Result<bool> {
    let verifying_key = VerifyingKey::from(public);
    let sig = Signature::from_der(der_sig).map_err(|e| PowerAuthError::encryption(format!("invalid DER signature: {e}")))?;
    Ok(verifying_key.verify(msg, &sig).is_ok())
}

/// Sign a pre-computed 32-byte digest directly, without hashing it again.
/// Used where a caller already hashed its input (e.g. vault signing over
/// `SHA-256(data)`) and a second implicit hash would sign the wrong value.
pub fn ecdsa_sign_prehashed(digest32: &[u8; 32], private: &SecretKey) -> Result<Vec<u8>> {
    let signing_key = SigningKey::from(private);
    let sig: Signature = signing_key
        .sign_prehash(digest32)
        .map_err(|e| PowerAuthError::encryption(format!("ecdsa prehashed sign: {e}")))?;
    Ok(sig.to_der().as_bytes().to_vec())
}

pub fn ecdsa_verify_prehashed(digest32: &[u8; 32], der_sig: &[u8], public: &PublicKey) -> Result<bool> {
    let verifying_key = VerifyingKey::from(public);
    let sig = Signature::from_der(der_sig).map_err(|e| PowerAuthError::encryption(format!("invalid DER signature: {e}")))?;
    Ok(verifying_key.verify_prehash(digest32, &sig).is_ok())
}

/// Convert a DER-encoded ECDSA signature to JOSE form: raw 64-byte `R || S`,
/// big-endian, zero-padded.
pub fn der_to_jose(der_sig: &[u8]) -> Result<[u8; 64]> {
    let sig = Signature::from_der(der_sig).map_err(|e| PowerAuthError::encryption(format!("invalid DER signature: {e}")))?;
    let mut out = [0u8; 64];
    out.copy_from_slice(&sig.to_bytes());
    Ok(out)
}

/// Convert a JOSE-form (raw 64-byte `R || S`) signature to DER, stripping
/// leading zero padding on each component and preserving sign by
/// prepending `0x00` when the high bit is set (standard DER integer rules).
pub fn jose_to_der(jose_sig: &[u8; 64]) -> Result<Vec<u8>> {
    let sig = Signature::from_slice(jose_sig).map_err(|e| PowerAuthError::encryption(format!("invalid JOSE signature: {e}")))?;
    Ok(sig.to_der().as_bytes().to_vec())
}

/// ECDSA compute/validate: confirm a private key can actually produce a
/// signature that verifies against its own public key.
pub fn validate_signing_capability(private: &SecretKey) -> Result<()> {
    let public = private.public_key();
    let sig = ecdsa_sign(b"powerauth-key-validation-probe", private)?;
    if ecdsa_verify(b"powerauth-key-validation-probe", &sig, &public)? {
        Ok(())
    } else {
        Err(PowerAuthError::encryption("private key failed self-signing validation"))
    }
}

pub fn affine_point_is_identity(point: &AffinePoint) -> bool {
    use p256::elliptic_curve::group::GroupEncoding;
    point.to_bytes().iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_import_public_key_roundtrip() {
        let kp = generate_key_pair();
        let exported = export_public_key(&kp.public);
        let imported = import_public_key(&exported).unwrap();
        assert_eq!(imported, kp.public);
    }

    #[test]
    fn export_import_private_key_roundtrip() {
        let kp = generate_key_pair();
        let exported = export_private_key(&kp.private);
        let imported = import_private_key(&exported).unwrap();
        assert_eq!(imported.to_bytes(), kp.private.to_bytes());
    }

    #[test]
    fn rejects_invalid_public_key_length() {
        assert!(import_public_key(&[0u8; 10]).is_err());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = generate_key_pair();
        let b = generate_key_pair();
        let s1 = ecdh_raw(&a.private, &b.public).unwrap();
        let s2 = ecdh_raw(&b.private, &a.public).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let kp = generate_key_pair();
        let sig = ecdsa_sign(b"hello", &kp.private).unwrap();
        assert!(ecdsa_verify(b"hello", &sig, &kp.public).unwrap());
        assert!(!ecdsa_verify(b"goodbye", &sig, &kp.public).unwrap());
    }

    #[test]
    fn der_jose_roundtrip() {
        let kp = generate_key_pair();
        let der = ecdsa_sign(b"msg", &kp.private).unwrap();
        let jose = der_to_jose(&der).unwrap();
        let der2 = jose_to_der(&jose).unwrap();
        assert!(ecdsa_verify(b"msg", &der2, &kp.public).unwrap());
    }

    #[test]
    fn validates_signing_capability() {
        let kp = generate_key_pair();
        assert!(validate_signing_capability(&kp.private).is_ok());
    }

    #[test]
    fn prehashed_sign_verify_roundtrip() {
        let kp = generate_key_pair();
        let digest = crate::crypto::sha256(b"vault payload");
        let sig = ecdsa_sign_prehashed(&digest, &kp.private).unwrap();
        assert!(ecdsa_verify_prehashed(&digest, &sig, &kp.public).unwrap());
        let other_digest = crate::crypto::sha256(b"different payload");
        assert!(!ecdsa_verify_prehashed(&other_digest, &sig, &kp.public).unwrap());
    }
}
