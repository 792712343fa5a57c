//! Cipher-suite contract and the process-wide suite registry.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use super::{aead, cbc, KeyMaterial};
use crate::error::{CodecError, Result};

/// Identifies one of the built-in cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SuiteId {
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "aes-256-cbc-hmac-sha256")]
    Aes256CbcHmacSha256,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl SuiteId {
    pub const ALL: [SuiteId; 4] = [
        SuiteId::Aes256Cbc,
        SuiteId::Aes256CbcHmacSha256,
        SuiteId::Aes256Gcm,
        SuiteId::XChaCha20Poly1305,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SuiteId::Aes256Cbc => "aes-256-cbc",
            SuiteId::Aes256CbcHmacSha256 => "aes-256-cbc-hmac-sha256",
            SuiteId::Aes256Gcm => "aes-256-gcm",
            SuiteId::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// Identifier byte stored in the page-1 header.
    pub fn wire_id(&self) -> u8 {
        match self {
            SuiteId::Aes256Cbc => 1,
            SuiteId::Aes256CbcHmacSha256 => 2,
            SuiteId::Aes256Gcm => 3,
            SuiteId::XChaCha20Poly1305 => 4,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.wire_id() == id)
            .ok_or_else(|| CodecError::UnknownCipher(format!("wire id {id}")))
    }

    fn index(&self) -> usize {
        usize::from(self.wire_id() - 1)
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SuiteId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|id| id.name() == wanted)
            .ok_or_else(|| CodecError::UnknownCipher(s.to_string()))
    }
}

/// A keyed page transform.
///
/// Suites are stateless: the key is handed in on every call and no keyed
/// state outlives the call. `data` is the encrypted region of the page,
/// transformed in place. `trailer` is the suite's slice of the reserved
/// area (exactly [`reserved_bytes`](Self::reserved_bytes) long) holding
/// nonce/IV and tag. `prefix` is the unencrypted page-1 header, empty for
/// every other page; authenticated suites cover it with their tag.
pub trait CipherSuite: Send + Sync + 'static {
    fn id(&self) -> SuiteId;

    fn name(&self) -> &'static str {
        self.id().name()
    }

    fn key_len(&self) -> usize;

    /// Trailer bytes this suite needs at the end of every page.
    fn reserved_bytes(&self) -> usize;

    /// The encrypted region must be a multiple of this.
    fn block_size(&self) -> usize;

    fn is_authenticated(&self) -> bool;

    fn encrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        prefix: &[u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Result<()>;

    /// Inverse of [`encrypt`](Self::encrypt). Authenticated suites verify
    /// before touching `data` and fail with
    /// [`CodecError::AuthenticationFailure`].
    fn decrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        prefix: &[u8],
        data: &mut [u8],
        trailer: &[u8],
    ) -> Result<()>;
}

impl fmt::Debug for dyn CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSuite")
            .field("name", &self.name())
            .field("key_len", &self.key_len())
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

/// Read-only table of the registered suites, indexed by [`SuiteId`].
pub struct SuiteRegistry {
    suites: [&'static dyn CipherSuite; SuiteId::ALL.len()],
}

static REGISTRY: LazyLock<SuiteRegistry> = LazyLock::new(|| SuiteRegistry {
    suites: [
        &cbc::AES_256_CBC,
        &cbc::AES_256_CBC_HMAC_SHA256,
        &aead::AES_256_GCM,
        &aead::XCHACHA20_POLY1305,
    ],
});

/// The process-wide suite registry, built on first use.
pub fn registry() -> &'static SuiteRegistry {
    &REGISTRY
}

impl SuiteRegistry {
    pub fn get(&self, id: SuiteId) -> &'static dyn CipherSuite {
        self.suites[id.index()]
    }

    pub fn by_name(&self, name: &str) -> Result<&'static dyn CipherSuite> {
        Ok(self.get(name.parse()?))
    }

    pub fn by_wire_id(&self, id: u8) -> Result<&'static dyn CipherSuite> {
        Ok(self.get(SuiteId::from_wire_id(id)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static dyn CipherSuite> + '_ {
        self.suites.iter().copied()
    }
}
