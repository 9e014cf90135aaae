//! Crypto primitives facade: the leaf layer every other module builds on,
//! over the RustCrypto stack (`aes`, `cbc`, `hmac`, `sha2`, `sha1`,
//! `pbkdf2`, `p256`).

pub mod aes;
pub mod ecc;
pub mod hmac;
pub mod kdf;
pub mod prng;

pub use self::aes::{aes_cbc_decrypt, aes_cbc_decrypt_pkcs7, aes_cbc_encrypt, aes_cbc_encrypt_pkcs7};
pub use self::ecc::{
    der_to_jose, ecdh_raw, ecdsa_sign, ecdsa_sign_prehashed, ecdsa_verify, ecdsa_verify_prehashed, export_private_key,
    export_public_key, generate_key_pair, import_private_key, import_public_key, jose_to_der, validate_signing_capability,
    KeyPair,
};
pub use self::hmac::{hmac_sha256, hmac_sha256_full, pbkdf2_hmac_sha1, sha256};
pub use self::kdf::{ecdh_kdf_x963_sha256, reduce_shared_secret, xor_halves};
pub use self::prng::{random_bytes, random_bytes_reject_zero, unique_random_bytes};
