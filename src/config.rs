//! JSON configuration for creating an encrypted database.
//!
//! ```json
//! { "cipher": "xchacha20-poly1305", "passphrase": "...", "page_size": 4096 }
//! ```
//! Every field other than the secret has a default.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::codec::{DEFAULT_PAGE_SIZE, PageGeometry};
use crate::crypto::{CipherSuite, KdfParams, Secret, SuiteId, registry};
use crate::error::{CodecError, Result};

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodecConfig {
    #[serde(default = "default_cipher")]
    pub cipher: SuiteId,
    #[serde(default = "default_iterations")]
    pub key_derivation_iterations: u32,
    #[serde(default = "default_memory")]
    pub kdf_memory_kib: u32,
    #[serde(default = "default_parallelism")]
    pub kdf_parallelism: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Hex encoded key of exactly the cipher's key length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Defaults to the cipher's trailer size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_bytes: Option<usize>,
}

fn default_cipher() -> SuiteId {
    SuiteId::XChaCha20Poly1305
}

fn default_iterations() -> u32 {
    KdfParams::default().time_cost()
}

fn default_memory() -> u32 {
    KdfParams::default().mem_cost_kib()
}

fn default_parallelism() -> u32 {
    KdfParams::default().parallelism()
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl CodecConfig {
    /// Defaults for `cipher`, without a secret.
    pub fn new(cipher: SuiteId) -> Self {
        Self {
            cipher,
            key_derivation_iterations: default_iterations(),
            kdf_memory_kib: default_memory(),
            kdf_parallelism: default_parallelism(),
            passphrase: None,
            raw_key: None,
            page_size: default_page_size(),
            reserved_bytes: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_raw_key(mut self, key: &[u8]) -> Self {
        self.raw_key = Some(hex::encode(key));
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf_memory_kib = kdf.mem_cost_kib();
        self.key_derivation_iterations = kdf.time_cost();
        self.kdf_parallelism = kdf.parallelism();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_reserved_bytes(mut self, reserved: usize) -> Self {
        self.reserved_bytes = Some(reserved);
        self
    }

    /// Parses a configuration. The secret may be left out and supplied
    /// later; everything else is checked here.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CodecError::InvalidConfig(e.to_string()))?;
        config.kdf_params()?;
        config.geometry().validate(config.suite())?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn suite(&self) -> &'static dyn CipherSuite {
        registry().get(self.cipher)
    }

    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::new(
            self.kdf_memory_kib,
            self.key_derivation_iterations,
            self.kdf_parallelism,
        )
    }

    pub fn geometry(&self) -> PageGeometry {
        PageGeometry::new(
            self.page_size,
            self.reserved_bytes
                .unwrap_or_else(|| self.suite().reserved_bytes()),
        )
    }

    /// The configured secret. Exactly one of `passphrase` and `raw_key`
    /// must be set.
    pub fn secret(&self) -> Result<Secret> {
        match (&self.passphrase, &self.raw_key) {
            (Some(passphrase), None) => Ok(Secret::passphrase(passphrase.as_str())),
            (None, Some(raw_key)) => Secret::from_hex(raw_key),
            (Some(_), Some(_)) => Err(CodecError::InvalidConfig(
                "passphrase and raw_key are mutually exclusive".to_string(),
            )),
            (None, None) => Err(CodecError::InvalidConfig(
                "either passphrase or raw_key is required".to_string(),
            )),
        }
    }

    /// Checks the secret, KDF parameters and page geometry.
    pub fn validate(&self) -> Result<()> {
        self.secret()?;
        self.kdf_params()?;
        self.geometry().validate(self.suite())
    }
}

impl Drop for CodecConfig {
    fn drop(&mut self) {
        self.passphrase.zeroize();
        self.raw_key.zeroize();
    }
}

impl fmt::Debug for CodecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecConfig")
            .field("cipher", &self.cipher)
            .field("key_derivation_iterations", &self.key_derivation_iterations)
            .field("kdf_memory_kib", &self.kdf_memory_kib)
            .field("kdf_parallelism", &self.kdf_parallelism)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("raw_key", &self.raw_key.as_ref().map(|_| "<redacted>"))
            .field("page_size", &self.page_size)
            .field("reserved_bytes", &self.reserved_bytes)
            .finish()
    }
}
