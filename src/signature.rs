//! HTTP request signing: normalization, online/offline signature
//! calculation, counter advance, and the `X-PowerAuth-Authorization`
//! header value layout.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crate::crypto;
use crate::error::{PowerAuthError, Result};
use crate::keys::{DerivedKeys, SignatureFactor, SIGNATURE_FACTOR_ORDER};

pub const HEADER_NAME: &str = "X-PowerAuth-Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl HttpMethod {
    fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Head => "HEAD",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

pub struct HttpRequestData<'a> {
    pub method: HttpMethod,
    pub uri: &'a str,
    pub body: &'a [u8],
    pub offline_nonce: Option<[u8; 16]>,
    pub offline_signature_length: Option<u8>,
}

impl<'a> HttpRequestData<'a> {
    pub fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(PowerAuthError::wrong_param("uri must be non-empty"));
        }
        if let Some(len) = self.offline_signature_length {
            if !(4..=8).contains(&len) {
                return Err(PowerAuthError::wrong_param("offlineSignatureLength must be in [4, 8]"));
            }
        }
        Ok(())
    }
}

/// Build the normalization string:
/// `METHOD & B64(uri) & B64(nonce) & B64(body) & app_secret`.
pub fn normalize(method: HttpMethod, uri: &str, nonce: &[u8], body: &[u8], app_secret: &[u8], offline: bool) -> Vec<u8> {
    let secret_str: Vec<u8> = if offline { b"offline".to_vec() } else { app_secret.to_vec() };
    let mut out = Vec::new();
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b'&');
    out.extend_from_slice(B64.encode(uri.as_bytes()).as_bytes());
    out.push(b'&');
    out.extend_from_slice(B64.encode(nonce).as_bytes());
    out.push(b'&');
    out.extend_from_slice(B64.encode(body).as_bytes());
    out.push(b'&');
    out.extend_from_slice(&secret_str);
    out
}

/// The ordered per-factor 32-byte digests `S_0, S_1, ...`.
fn derive_signature_digests(ctr: &[u8; 16], keys: &DerivedKeys, factor: SignatureFactor, norm: &[u8]) -> Result<Vec<[u8; 32]>> {
    let ordered_keys: Vec<[u8; 16]> = SIGNATURE_FACTOR_ORDER
        .iter()
        .filter(|f| factor.contains(**f))
        .map(|f| match *f {
            SignatureFactor::POSSESSION => keys.possession,
            SignatureFactor::KNOWLEDGE => keys.knowledge,
            SignatureFactor::BIOMETRY => keys.biometry,
            _ => unreachable!("SIGNATURE_FACTOR_ORDER only contains possession/knowledge/biometry"),
        })
        .collect();
    if ordered_keys.is_empty() {
        return Err(PowerAuthError::wrong_param("at least one signature factor must be selected"));
    }

    let mut digests = Vec::with_capacity(ordered_keys.len());
    for i in 0..ordered_keys.len() {
        let mut d_i = crypto::hmac_sha256_full(ctr, &ordered_keys[i]);
        for j in 0..i {
            let inner = crypto::hmac_sha256_full(ctr, &ordered_keys[j + 1]);
            d_i = crypto::hmac_sha256_full(&d_i, &inner);
        }
        let s_i = crypto::hmac_sha256_full(norm, &d_i);
        digests.push(s_i);
    }
    Ok(digests)
}

/// Online signature: `Base64(S_0[16..31] || S_1[16..31] || ...)`.
pub fn calculate_online_signature(ctr: &[u8; 16], keys: &DerivedKeys, factor: SignatureFactor, norm: &[u8]) -> Result<String> {
    let digests = derive_signature_digests(ctr, keys, factor, norm)?;
    let mut out = Vec::with_capacity(digests.len() * 16);
    for d in &digests {
        out.extend_from_slice(&d[16..32]);
    }
    Ok(B64.encode(out))
}

/// `dec(x)`: last 4 bytes of `x`, MSB of the first byte masked, read as a
/// big-endian u32, reduced modulo `10^len` and zero-padded.
fn dec(x: &[u8; 32], len: u8) -> String {
    let tail = &x[28..32];
    let masked = [tail[0] & 0x7F, tail[1], tail[2], tail[3]];
    let value = u32::from_be_bytes(masked);
    let modulus = 10u32.pow(len as u32);
    format!("{:0width$}", value % modulus, width = len as usize)
}

/// Offline signature: `dec(S_0) - dec(S_1) - ...`.
pub fn calculate_offline_signature(ctr: &[u8; 16], keys: &DerivedKeys, factor: SignatureFactor, norm: &[u8], digit_len: u8) -> Result<String> {
    let digests = derive_signature_digests(ctr, keys, factor, norm)?;
    let parts: Vec<String> = digests.iter().map(|d| dec(d, digit_len)).collect();
    Ok(parts.join("-"))
}

/// Advance the V3 hash-chain counter: `ctr <- reduce_shared_secret(sha256(ctr))`.
pub fn advance_counter(ctr: &[u8; 16]) -> Result<[u8; 16]> {
    let hash = crypto::sha256(ctr);
    crypto::reduce_shared_secret(&hash)
}

pub fn factor_type_string(factor: SignatureFactor) -> Result<&'static str> {
    let p = factor.contains(SignatureFactor::POSSESSION);
    let k = factor.contains(SignatureFactor::KNOWLEDGE);
    let b = factor.contains(SignatureFactor::BIOMETRY);
    match (p, k, b) {
        (true, false, false) => Ok("possession"),
        (false, true, false) => Ok("knowledge"),
        (false, false, true) => Ok("biometry"),
        (true, true, false) => Ok("possession_knowledge"),
        (true, false, true) => Ok("possession_biometry"),
        (true, true, true) => Ok("possession_knowledge_biometry"),
        _ => Err(PowerAuthError::wrong_param("invalid signature factor combination for header")),
    }
}

pub struct AuthHeaderFields<'a> {
    pub version: &'a str,
    pub activation_id: &'a str,
    pub application_key: &'a str,
    pub nonce_b64: &'a str,
    pub signature_type: &'a str,
    pub signature: &'a str,
}

pub fn format_auth_header(fields: &AuthHeaderFields) -> String {
    format!(
        "PowerAuth pa_version=\"{}\", pa_activation_id=\"{}\", pa_application_key=\"{}\", pa_nonce=\"{}\", pa_signature_type=\"{}\", pa_signature=\"{}\"",
        fields.version, fields.activation_id, fields.application_key, fields.nonce_b64, fields.signature_type, fields.signature
    )
}
