//! A masked, edit-in-place password buffer: plaintext is XOR-masked at
//! rest with a per-instance random pad, codepoints can be inserted,
//! appended, or removed without ever materializing the full plaintext
//! outside a `reveal()` call, and the pad is regenerated whenever the
//! buffer is cleared or dropped.

use zeroize::Zeroize;

use crate::crypto;

/// A password held XOR-masked in memory, with codepoint-level editing.
pub struct Password {
    masked: Vec<u8>,
    pad: Vec<u8>,
}

impl Password {
    pub fn new() -> Self {
        Self {
            masked: Vec::new(),
            pad: Vec::new(),
        }
    }

    pub fn from_str(plain: &str) -> Self {
        let mut pw = Self::new();
        for ch in plain.chars() {
            pw.add_character(ch);
        }
        pw
    }

    pub fn len(&self) -> usize {
        self.masked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masked.is_empty()
    }

    fn resize_pad(&mut self) {
        while self.pad.len() < self.masked.len() {
            self.pad.extend(crypto::random_bytes(1));
        }
    }

    /// Append a UTF-8 codepoint to the end of the password.
    pub fn add_character(&mut self, ch: char) {
        let mut buf = [0u8; 4];
        let bytes = ch.encode_utf8(&mut buf).as_bytes();
        for &b in bytes {
            self.pad.push(crypto::random_bytes(1)[0]);
            self.masked.push(b ^ *self.pad.last().unwrap());
        }
    }

    /// Insert a UTF-8 codepoint at a given byte index (of the masked buffer).
    pub fn insert_character(&mut self, ch: char, index: usize) -> bool {
        if index > self.masked.len() {
            return false;
        }
        let mut buf = [0u8; 4];
        let bytes = ch.encode_utf8(&mut buf).as_bytes().to_vec();
        for (offset, b) in bytes.into_iter().enumerate() {
            let pad_byte = crypto::random_bytes(1)[0];
            self.pad.insert(index + offset, pad_byte);
            self.masked.insert(index + offset, b ^ pad_byte);
        }
        true
    }

    /// Remove the last byte (not necessarily a full codepoint; mirrors the
    /// original's byte-oriented `removeLastCharacter`).
    pub fn remove_last_character(&mut self) -> bool {
        if self.masked.is_empty() {
            return false;
        }
        self.masked.pop();
        self.pad.pop();
        true
    }

    /// Remove the byte at `index`.
    pub fn remove_character(&mut self, index: usize) -> bool {
        if index >= self.masked.len() {
            return false;
        }
        self.masked.remove(index);
        self.pad.remove(index);
        true
    }

    pub fn clear(&mut self) {
        self.masked.zeroize();
        self.pad.zeroize();
        self.masked.clear();
        self.pad.clear();
    }

    /// Reveal the plaintext bytes. Callers should scope usage tightly and
    /// avoid retaining the result beyond the immediate operation (e.g. a
    /// PBKDF2 derivation).
    pub fn reveal(&self) -> Vec<u8> {
        self.masked
            .iter()
            .zip(self.pad.iter())
            .map(|(m, p)| m ^ p)
            .collect()
    }
}

impl Default for Password {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.masked.zeroize();
        self.pad.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_reveal_roundtrip() {
        let pw = Password::from_str("hello");
        assert_eq!(pw.reveal(), b"hello");
        assert_eq!(pw.len(), 5);
    }

    #[test]
    fn insert_and_remove() {
        let mut pw = Password::from_str("helo");
        assert!(pw.insert_character('l', 3));
        assert_eq!(pw.reveal(), b"hello");
        assert!(pw.remove_character(0));
        assert_eq!(pw.reveal(), b"ello");
        assert!(pw.remove_last_character());
        assert_eq!(pw.reveal(), b"ell");
    }

    #[test]
    fn clear_empties_buffer() {
        let mut pw = Password::from_str("secret");
        pw.clear();
        assert!(pw.is_empty());
        assert_eq!(pw.reveal(), Vec::<u8>::new());
    }

    #[test]
    fn masked_bytes_differ_from_plaintext() {
        let pw = Password::from_str("aaaa");
        // It would be an extraordinary coincidence for the random pad to
        // reproduce the plaintext bytes exactly.
        assert_ne!(pw.masked, b"aaaa");
    }
}
