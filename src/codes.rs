//! Activation code / recovery code / PUK parsing, Base32 + CRC-16/ARC
//! validation, and typed-character autocorrection.

use data_encoding::{Encoding, Specification};

use crate::error::{PowerAuthError, Result};

fn base32_no_pad() -> Encoding {
    let mut spec = Specification::new();
    spec.symbols.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567");
    spec.encoding().expect("valid base32 specification")
}

/// CRC-16/ARC (poly 0xA001, init 0x0000, reflected), table-free bitwise
/// form.
pub fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn decode_groups(code_without_prefix: &str) -> Result<[u8; 12]> {
    let groups: Vec<&str> = code_without_prefix.split('-').collect();
    if groups.len() != 4 || groups.iter().any(|g| g.len() != 5) {
        return Err(PowerAuthError::wrong_param("code must be 4 groups of 5 Base32 characters"));
    }
    let joined: String = groups.concat();
    let decoded = base32_no_pad()
        .decode(joined.as_bytes())
        .map_err(|_| PowerAuthError::encryption("invalid Base32 in code"))?;
    if decoded.len() != 12 {
        return Err(PowerAuthError::encryption("decoded code must be 12 bytes"));
    }
    let mut out = [0u8; 12];
    out.copy_from_slice(&decoded);
    Ok(out)
}

fn validate_crc(decoded: &[u8; 12]) -> bool {
    let payload = &decoded[..10];
    let expected = u16::from_be_bytes([decoded[10], decoded[11]]);
    crc16_arc(payload) == expected
}

/// Encode a 10-byte payload into a CRC16-checked 4x5 Base32 grouped code
/// (`XXXXX-XXXXX-XXXXX-XXXXX`), mainly used by tests and vector generation.
pub fn encode_base32_with_crc16(payload: &[u8; 10]) -> String {
    let crc = crc16_arc(payload);
    let mut full = [0u8; 12];
    full[..10].copy_from_slice(payload);
    full[10..].copy_from_slice(&crc.to_be_bytes());
    let encoded = base32_no_pad().encode(&full);
    format!("{}-{}-{}-{}", &encoded[0..5], &encoded[5..10], &encoded[10..15], &encoded[15..20])
}

/// Parsed activation code, optionally carrying a server signature suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationCode {
    pub code: String,
    pub signature: Option<Vec<u8>>,
}

/// Validate and parse an activation code of the form
/// `XXXXX-XXXXX-XXXXX-XXXXX[#<base64 signature>]`.
pub fn parse_activation_code(input: &str) -> Result<ActivationCode> {
    let (code_part, sig_part) = match input.split_once('#') {
        Some((c, s)) => (c, Some(s)),
        None => (input, None),
    };
    if !validate_activation_code(code_part) {
        return Err(PowerAuthError::wrong_param("invalid activation code"));
    }
    let signature = match sig_part {
        Some(s) => Some(
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
                .map_err(|_| PowerAuthError::encryption("invalid base64 activation signature"))?,
        ),
        None => None,
    };
    Ok(ActivationCode {
        code: code_part.to_string(),
        signature,
    })
}

/// `validate_activation_code`: 20 characters of Base32 in 4 groups of 5,
/// CRC-16/ARC over the first 10 decoded bytes must equal the last 2.
pub fn validate_activation_code(code: &str) -> bool {
    match decode_groups(code) {
        Ok(decoded) => validate_crc(&decoded),
        Err(_) => false,
    }
}

/// Validate a recovery code, with an optional `R:` prefix. Never carries a
/// `#signature` suffix.
pub fn validate_recovery_code(code: &str) -> bool {
    let stripped = code.strip_prefix("R:").unwrap_or(code);
    if stripped.contains('#') {
        return false;
    }
    validate_activation_code(stripped)
}

/// Validate a recovery PUK: exactly 10 ASCII decimal digits.
pub fn validate_recovery_puk(puk: &str) -> bool {
    puk.len() == 10 && puk.bytes().all(|b| b.is_ascii_digit())
}

/// Typed-character autocorrection: lowercase -> upper, `0 -> O`, `1 -> I`.
/// Returns `None` for characters that can never appear in a valid code.
pub fn correct_typed_character(ch: char) -> Option<char> {
    match ch {
        'a'..='z' => Some(ch.to_ascii_uppercase()),
        'A'..='Z' | '2'..='7' | '-' => Some(ch),
        '0' => Some('O'),
        '1' => Some('I'),
        _ => None,
    }
}

pub fn validate_typed_character(ch: char) -> bool {
    correct_typed_character(ch).is_some()
}
