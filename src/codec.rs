//! Versioned binary persistent-data codec, built on small `DataWriter`/
//! `DataReader` helpers over a TLV layout.

use crate::error::{PowerAuthError, Result};
use crate::keys::SignatureKeys;

/// Serialized format version byte, from oldest to newest supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataVersion {
    /// `'3'`: V2, legacy 64-bit counter.
    V2 = b'3' as isize,
    /// `'4'`: V3, no counter byte.
    V3NoCtrByte = b'4' as isize,
    /// `'5'`: V3 with counter byte.
    V3CtrByte = b'5' as isize,
    /// `'6'`: V3.1, counter byte + recovery data.
    V3_1 = b'6' as isize,
}

impl DataVersion {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'3' => Ok(Self::V2),
            b'4' => Ok(Self::V3NoCtrByte),
            b'5' => Ok(Self::V3CtrByte),
            b'6' => Ok(Self::V3_1),
            other => Err(PowerAuthError::encryption(format!("unsupported persistent data version tag 0x{other:02x}"))),
        }
    }

    fn tag(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone)]
pub struct PersistentData {
    pub version: DataVersion,
    pub activation_id: String,
    /// V2 legacy counter; meaningful only when `version == V2`.
    pub legacy_counter: u64,
    /// V3 hash-chain counter; meaningful when `version >= V3NoCtrByte`.
    pub signature_counter_data: [u8; 16],
    pub has_signature_counter_byte: bool,
    pub signature_counter_byte: u8,
    pub password_iterations: u32,
    pub password_salt: [u8; 16],
    pub keys: SignatureKeys,
    pub server_public_key: [u8; 33],
    pub device_public_key: [u8; 33],
    pub c_device_private_key: Vec<u8>,
    pub c_recovery_data: Vec<u8>,
    pub pending_upgrade_version: u8,
    /// No longer consulted in V3; kept for forward-compatible
    /// serialization only.
    pub waiting_for_vault_unlock: bool,
}

impl PersistentData {
    pub fn validate(&self) -> Result<()> {
        if self.version >= DataVersion::V3NoCtrByte && self.signature_counter_data.len() != 16 {
            return Err(PowerAuthError::wrong_param("signatureCounterData must be 16 bytes for V3+"));
        }
        if self.password_salt.len() != 16 {
            return Err(PowerAuthError::wrong_param("passwordSalt must be 16 bytes"));
        }
        if self.password_iterations < 10_000 {
            return Err(PowerAuthError::wrong_param("passwordIterations must be >= 10000"));
        }
        for (name, ct) in [
            ("possession", &self.keys.possession),
            ("knowledge", &self.keys.knowledge),
            ("transport", &self.keys.transport),
        ] {
            if ct.len() != 16 {
                return Err(PowerAuthError::wrong_param(format!("{name} key ciphertext must be 16 bytes")));
            }
        }
        if !self.keys.biometry.is_empty() && self.keys.biometry.len() != 16 {
            return Err(PowerAuthError::wrong_param("biometry key ciphertext must be empty or 16 bytes"));
        }
        Ok(())
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_u64_be(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_fixed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn write_count(&mut self, n: usize) -> Result<()> {
        if n <= 0x7F {
            self.buf.push(n as u8);
        } else if n <= 0x3FFF {
            let v = 0x8000u16 | (n as u16);
            self.buf.extend_from_slice(&v.to_be_bytes());
        } else if n <= 0x3FFF_FFFF {
            let v = 0xC000_0000u32 | (n as u32);
            self.buf.extend_from_slice(&v.to_be_bytes());
        } else {
            return Err(PowerAuthError::wrong_param("count exceeds maximum encodable value"));
        }
        Ok(())
    }

    fn write_counted_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_count(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or_else(|| PowerAuthError::encryption("unexpected end of data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let bytes = self.read_fixed_vec(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64_be(&mut self) -> Result<u64> {
        let bytes = self.read_fixed_vec(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_fixed_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.pos + n > self.data.len() {
            return Err(PowerAuthError::encryption("unexpected end of data"));
        }
        let slice = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(slice)
    }

    fn read_count(&mut self) -> Result<usize> {
        let b0 = self.read_u8()?;
        if b0 & 0x80 == 0 {
            Ok(b0 as usize)
        } else if b0 & 0xC0 == 0x80 {
            let b1 = self.read_u8()?;
            Ok((((b0 & 0x3F) as usize) << 8) | b1 as usize)
        } else {
            let b1 = self.read_u8()?;
            let b2 = self.read_u8()?;
            let b3 = self.read_u8()?;
            Ok((((b0 & 0x3F) as usize) << 24) | ((b1 as usize) << 16) | ((b2 as usize) << 8) | b3 as usize)
        }
    }

    fn read_counted_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.read_count()?;
        self.read_fixed_vec(n)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

const NO_ACTIVATION_SENTINEL: [u8; 5] = [b'P', b'A', 0, 0, b'M'];

/// Serialize full session persistence state. `pd == None` produces the
/// 5-byte "no activation" sentinel.
pub fn serialize_session_state(pd: Option<&PersistentData>) -> Vec<u8> {
    match pd {
        None => NO_ACTIVATION_SENTINEL.to_vec(),
        Some(pd) => {
            let inner = serialize_persistent_data(pd);
            let mut out = Vec::with_capacity(inner.len() + 3);
            out.push(b'P');
            out.push(b'A');
            out.push(0x02);
            out.extend_from_slice(&inner);
            out
        }
    }
}

pub fn deserialize_session_state(data: &[u8]) -> Result<Option<PersistentData>> {
    if data == NO_ACTIVATION_SENTINEL {
        return Ok(None);
    }
    if data.len() < 3 || data[0] != b'P' || data[1] != b'A' {
        return Err(PowerAuthError::encryption("invalid session state envelope magic"));
    }
    let flags = data[2];
    if flags & 0x02 == 0 {
        return Ok(None);
    }
    let pd = deserialize_persistent_data(&data[3..])?;
    Ok(Some(pd))
}

fn serialize_persistent_data(pd: &PersistentData) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(b'P');
    w.write_u8(pd.version.tag());
    w.write_counted_bytes(pd.activation_id.as_bytes()).expect("bounded string length");

    if pd.version == DataVersion::V2 {
        w.write_u64_be(pd.legacy_counter);
    } else {
        w.write_fixed(&pd.signature_counter_data);
        if pd.version >= DataVersion::V3CtrByte {
            w.write_u8(pd.signature_counter_byte);
        }
    }

    w.write_u32_be(pd.password_iterations);
    w.write_fixed(&pd.password_salt);

    w.write_counted_bytes(&pd.keys.possession).expect("16-byte key fits count encoding");
    w.write_counted_bytes(&pd.keys.knowledge).expect("16-byte key fits count encoding");
    w.write_counted_bytes(&pd.keys.biometry).expect("16-byte key fits count encoding");
    w.write_counted_bytes(&pd.keys.transport).expect("16-byte key fits count encoding");

    w.write_fixed(&pd.server_public_key);
    w.write_fixed(&pd.device_public_key);
    w.write_counted_bytes(&pd.c_device_private_key).expect("encrypted private key fits count encoding");

    if pd.version == DataVersion::V3_1 {
        w.write_counted_bytes(&pd.c_recovery_data).expect("encrypted recovery data fits count encoding");
    }

    let mut flags: u32 = 0;
    if pd.keys.uses_external_key {
        flags |= 0x01;
    }
    flags |= (pd.pending_upgrade_version as u32) << 8;
    if pd.has_signature_counter_byte {
        flags |= 0x1_0000;
    }
    if pd.waiting_for_vault_unlock {
        flags |= 0x2_0000;
    }
    w.write_u32_be(flags);
    w.write_u8(b'M');

    w.into_vec()
}

fn deserialize_persistent_data(data: &[u8]) -> Result<PersistentData> {
    let mut r = Reader::new(data);
    if r.read_u8()? != b'P' {
        return Err(PowerAuthError::encryption("invalid persistent data magic"));
    }
    let version = DataVersion::from_tag(r.read_u8()?)?;
    let activation_id = String::from_utf8(r.read_counted_bytes()?).map_err(|e| PowerAuthError::encryption(format!("invalid activation id utf-8: {e}")))?;

    let mut legacy_counter = 0u64;
    let mut signature_counter_data = [0u8; 16];
    let mut signature_counter_byte = 0u8;

    if version == DataVersion::V2 {
        legacy_counter = r.read_u64_be()?;
    } else {
        signature_counter_data.copy_from_slice(&r.read_fixed_vec(16)?);
        if version >= DataVersion::V3CtrByte {
            signature_counter_byte = r.read_u8()?;
        }
    }

    let password_iterations = r.read_u32_be()?;
    let password_salt: [u8; 16] = r.read_fixed_vec(16)?.try_into().unwrap();

    let possession = r.read_counted_bytes()?;
    let knowledge = r.read_counted_bytes()?;
    let biometry = r.read_counted_bytes()?;
    let transport = r.read_counted_bytes()?;

    let server_public_key: [u8; 33] = r.read_fixed_vec(33)?.try_into().unwrap();
    let device_public_key: [u8; 33] = r.read_fixed_vec(33)?.try_into().unwrap();
    let c_device_private_key = r.read_counted_bytes()?;

    let c_recovery_data = if version == DataVersion::V3_1 { r.read_counted_bytes()? } else { Vec::new() };

    let flags = r.read_u32_be()?;
    let terminator = r.read_u8()?;
    if terminator != b'M' {
        return Err(PowerAuthError::encryption("missing persistent data terminator"));
    }
    if r.remaining() != 0 {
        return Err(PowerAuthError::encryption("trailing bytes after persistent data"));
    }

    let uses_external_key = flags & 0x01 != 0;
    let pending_upgrade_version = ((flags >> 8) & 0xFF) as u8;
    let has_signature_counter_byte = flags & 0x1_0000 != 0;
    let waiting_for_vault_unlock = flags & 0x2_0000 != 0;

    let pd = PersistentData {
        version,
        activation_id,
        legacy_counter,
        signature_counter_data,
        has_signature_counter_byte,
        signature_counter_byte,
        password_iterations,
        password_salt,
        keys: SignatureKeys {
            possession,
            knowledge,
            biometry,
            transport,
            uses_external_key,
        },
        server_public_key,
        device_public_key,
        c_device_private_key,
        c_recovery_data,
        pending_upgrade_version,
        waiting_for_vault_unlock,
    };
    pd.validate()?;
    Ok(pd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: DataVersion) -> PersistentData {
        PersistentData {
            version,
            activation_id: "ED7BA470-8E54-465E-825C-99712043E01C".to_string(),
            legacy_counter: 42,
            signature_counter_data: [7u8; 16],
            has_signature_counter_byte: version >= DataVersion::V3CtrByte,
            signature_counter_byte: 3,
            password_iterations: 10_000,
            password_salt: [1u8; 16],
            keys: SignatureKeys {
                possession: vec![2u8; 16],
                knowledge: vec![3u8; 16],
                biometry: vec![4u8; 16],
                transport: vec![5u8; 16],
                uses_external_key: false,
            },
            server_public_key: [9u8; 33],
            device_public_key: [10u8; 33],
            c_device_private_key: vec![0xAAu8; 48],
            c_recovery_data: if version == DataVersion::V3_1 { vec![0xBBu8; 32] } else { Vec::new() },
            pending_upgrade_version: 0,
            waiting_for_vault_unlock: false,
        }
    }

    #[test]
    fn roundtrip_every_version() {
        for version in [DataVersion::V2, DataVersion::V3NoCtrByte, DataVersion::V3CtrByte, DataVersion::V3_1] {
            let pd = sample(version);
            let bytes = serialize_session_state(Some(&pd));
            let back = deserialize_session_state(&bytes).unwrap().unwrap();
            assert_eq!(back.activation_id, pd.activation_id);
            assert_eq!(back.keys.possession, pd.keys.possession);
            assert_eq!(back.version, version);
        }
    }

    #[test]
    fn no_activation_roundtrips_to_sentinel() {
        let bytes = serialize_session_state(None);
        assert_eq!(bytes, NO_ACTIVATION_SENTINEL);
        assert!(deserialize_session_state(&bytes).unwrap().is_none());
    }

    #[test]
    fn older_version_reads_without_error_and_reserializes_not_shorter() {
        let pd = sample(DataVersion::V2);
        let original = serialize_session_state(Some(&pd));
        let parsed = deserialize_session_state(&original).unwrap().unwrap();
        let reserialized = serialize_session_state(Some(&parsed));
        assert!(reserialized.len() >= original.len());
    }

    #[test]
    fn empty_biometry_means_factor_disabled() {
        let mut pd = sample(DataVersion::V3_1);
        pd.keys.biometry = Vec::new();
        let bytes = serialize_session_state(Some(&pd));
        let back = deserialize_session_state(&bytes).unwrap().unwrap();
        assert!(!back.keys.has_biometry());
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(deserialize_session_state(b"XXXXX").is_err());
    }
}
