//! Page-1 codec header.
//!
//! The first [`CODEC_HEADER_LEN`] bytes of page 1 are never encrypted. They
//! identify the file as encrypted and carry everything needed to rebuild
//! the key: cipher, key derivation parameters and salt. Provides
//! version-aware parsing and serialization.

use crate::crypto::{KEY_CHECK_LEN, KeyDerivation, SALT_LEN, SuiteId};
use crate::error::{CodecError, Result};

pub mod v1;

/// Magic bytes identifying an encrypted database ("PGCR").
pub const MAGIC: &[u8; 4] = b"PGCR";
/// Length of magic bytes.
pub const MAGIC_LEN: usize = 4;
/// Length of version field.
pub const VER_LEN: usize = 1;
/// Latest format version
pub const CURRENT_VERSION: u8 = v1::VERSION_V1;
/// Size of the unencrypted prefix of page 1.
pub const CODEC_HEADER_LEN: usize = 48;

/// Parsed page-1 codec header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecHeader {
    version: u8,
    suite: SuiteId,
    derivation: KeyDerivation,
    reserved: u8,
    page_size: u32,
    salt: [u8; SALT_LEN],
    key_check: [u8; KEY_CHECK_LEN],
}

impl CodecHeader {
    pub fn new(
        suite: SuiteId,
        derivation: KeyDerivation,
        page_size: u32,
        reserved: u8,
        salt: [u8; SALT_LEN],
    ) -> Self {
        Self {
            version: CURRENT_VERSION,
            suite,
            derivation,
            reserved,
            page_size,
            salt,
            key_check: [0u8; KEY_CHECK_LEN],
        }
    }

    pub fn with_key_check(mut self, key_check: [u8; KEY_CHECK_LEN]) -> Self {
        self.key_check = key_check;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn suite(&self) -> SuiteId {
        self.suite
    }

    pub fn derivation(&self) -> KeyDerivation {
        self.derivation
    }

    /// Reserved trailer bytes per page.
    pub fn reserved(&self) -> u8 {
        self.reserved
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Truncated MAC of the key, see [`KeyMaterial::check_value`](crate::KeyMaterial::check_value).
    pub fn key_check(&self) -> &[u8; KEY_CHECK_LEN] {
        &self.key_check
    }

    /// Constant-time comparison of the key check values of two headers.
    pub fn same_key_as(&self, other: &CodecHeader) -> bool {
        self.key_check
            .iter()
            .zip(other.key_check.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Returns `true` if `data` starts like an encrypted database.
pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= MAGIC_LEN && &data[..MAGIC_LEN] == MAGIC
}

/// Parses the codec header at the start of page 1.
///
/// Automatically dispatches to the appropriate version parser.
///
/// # Errors
///
/// Returns an error if:
/// - The data is too short
/// - The magic bytes are invalid
/// - The version is unsupported
pub fn parse(data: &[u8]) -> Result<CodecHeader> {
    if data.len() < MAGIC_LEN + VER_LEN {
        return Err(CodecError::InvalidHeader("file too short".to_string()));
    }

    if !is_encrypted(data) {
        return Err(CodecError::InvalidHeader("invalid magic".to_string()));
    }

    let version = data[MAGIC_LEN];

    match version {
        1 => v1::parse(data),
        _ => Err(CodecError::InvalidHeader(format!(
            "unsupported version: {version}"
        ))),
    }
}

/// Serializes a header into the page-1 prefix `out`.
///
/// # Errors
///
/// Returns an error if the version is unsupported or `out` is not
/// [`CODEC_HEADER_LEN`] bytes.
pub fn serialize_into(header: &CodecHeader, out: &mut [u8]) -> Result<()> {
    match header.version() {
        1 => v1::serialize_into(header, out),
        v => Err(CodecError::InvalidHeader(format!("unsupported version: {v}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_version_is_rejected() {
        let mut data = vec![0u8; CODEC_HEADER_LEN];
        data[..4].copy_from_slice(MAGIC);
        data[4] = 99;
        assert!(matches!(parse(&data), Err(CodecError::InvalidHeader(_))));
    }

    #[test]
    fn plaintext_page_is_not_encrypted() {
        assert!(!is_encrypted(b"SQLite format 3\0"));
        assert!(is_encrypted(b"PGCR\x01"));
        assert!(!is_encrypted(b"PG"));
    }
}
