use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::{CipherSuite, KEY_CHECK_LEN, SALT_LEN, check_key_len, secure_random};
use crate::error::{CodecError, Result};

/// Argon2id cost parameters. `time_cost` is the iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // default memory cost
            mem_cost_kib: 64 * 1024, // 64 MiB
            // default number of iterations
            time_cost: 3,
            // default number of threads
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CodecError::DerivationFailure(msg.to_string()));
        if self.mem_cost_kib < 8 {
            return fail("argon2 memory cost too low");
        }
        if self.time_cost < 1 {
            return fail("iteration count must be >= 1");
        }
        if self.parallelism < 1 {
            return fail("argon2 parallelism must be >= 1");
        }
        if self.mem_cost_kib < 8 * self.parallelism {
            return fail("argon2 memory cost must be at least 8 * parallelism");
        }
        Ok(())
    }
}

/// How a key was produced. Recorded in the page-1 header so the same
/// derivation can be replayed when the database is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDerivation {
    /// Caller supplied exact-length key bytes.
    Raw,
    Argon2id(KdfParams),
}

impl KeyDerivation {
    pub const RAW_ID: u8 = 0;
    pub const ARGON2ID_ID: u8 = 1;

    pub fn id(&self) -> u8 {
        match self {
            KeyDerivation::Raw => Self::RAW_ID,
            KeyDerivation::Argon2id(_) => Self::ARGON2ID_ID,
        }
    }
}

/// Secret input to key derivation.
pub enum Secret {
    Passphrase(Zeroizing<String>),
    /// Exact-length key bytes; bypasses derivation.
    RawKey(Zeroizing<Vec<u8>>),
}

impl Secret {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Secret::Passphrase(Zeroizing::new(passphrase.into()))
    }

    pub fn raw_key(key: impl Into<Vec<u8>>) -> Self {
        Secret::RawKey(Zeroizing::new(key.into()))
    }

    /// Parses a hex encoded raw key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CodecError::InvalidConfig(format!("raw key is not valid hex: {e}")))?;
        Ok(Secret::RawKey(Zeroizing::new(bytes)))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Passphrase(_) => f.write_str("Secret::Passphrase(<redacted>)"),
            Secret::RawKey(_) => f.write_str("Secret::RawKey(<redacted>)"),
        }
    }
}

/// Cipher-ready key bytes together with the salt and parameters that
/// produced them.
///
/// Deliberately not `Clone`: a `KeyMaterial` belongs to exactly one codec
/// context. The key bytes are wiped when the value is dropped or wiped.
pub struct KeyMaterial {
    key: Zeroizing<Vec<u8>>,
    salt: [u8; SALT_LEN],
    derivation: KeyDerivation,
}

impl KeyMaterial {
    /// Wraps caller supplied key bytes without derivation.
    pub fn raw(key: Zeroizing<Vec<u8>>, salt: [u8; SALT_LEN]) -> Self {
        Self {
            key,
            salt,
            derivation: KeyDerivation::Raw,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn derivation(&self) -> KeyDerivation {
        self.derivation
    }

    /// First bytes of HMAC-SHA256(key, label). Stored in the clear in the
    /// page-1 header; lets a wrong key be refused before any page is
    /// decrypted, which unauthenticated suites cannot do on their own.
    pub fn check_value(&self) -> Result<[u8; KEY_CHECK_LEN]> {
        let tag = self.check_mac()?.finalize().into_bytes();
        let mut out = [0u8; KEY_CHECK_LEN];
        out.copy_from_slice(&tag[..KEY_CHECK_LEN]);
        Ok(out)
    }

    /// Compares `expected` against [`check_value`](Self::check_value) in
    /// constant time. A mismatch is reported as an authentication failure
    /// of page 1, where the value is stored.
    pub fn verify_check_value(&self, expected: &[u8]) -> Result<()> {
        self.check_mac()?
            .verify_truncated_left(expected)
            .map_err(|_| CodecError::AuthenticationFailure { page: 1 })
    }

    fn check_mac(&self) -> Result<Hmac<Sha256>> {
        if self.key.is_empty() {
            return Err(CodecError::Released);
        }
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .map_err(|_| CodecError::DerivationFailure("key check unavailable".to_string()))?;
        mac.update(KEY_CHECK_LABEL);
        Ok(mac)
    }

    /// Overwrites the key bytes with zeros and drops them.
    pub fn wipe(&mut self) {
        self.key.zeroize();
        self.key.clear();
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("len", &self.key.len())
            .field("derivation", &self.derivation)
            .finish()
    }
}

const KEY_CHECK_LABEL: &[u8] = b"pagecrypt key check";

/// Generate salt
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    secure_random(&mut salt)?;
    Ok(salt)
}

/// Turns a passphrase or raw key into key material sized for `suite`.
///
/// Deterministic for identical inputs, which is what makes reopening an
/// existing database possible. `kdf` is ignored for raw keys.
pub fn derive_key(
    secret: &Secret,
    salt: &[u8; SALT_LEN],
    kdf: KdfParams,
    suite: &dyn CipherSuite,
) -> Result<KeyMaterial> {
    match secret {
        Secret::RawKey(bytes) => {
            check_key_len(suite, bytes)?;
            Ok(KeyMaterial::raw(Zeroizing::new(bytes.to_vec()), *salt))
        }
        Secret::Passphrase(passphrase) => {
            if passphrase.is_empty() {
                return Err(CodecError::DerivationFailure(
                    "passphrase must not be empty".to_string(),
                ));
            }
            kdf.validate()?;

            let params = Params::new(
                kdf.mem_cost_kib,
                kdf.time_cost,
                kdf.parallelism,
                Some(suite.key_len()),
            )
            .map_err(|e| {
                CodecError::DerivationFailure(format!("failed to construct Argon2 params: {e}"))
            })?;

            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

            let mut key = Zeroizing::new(vec![0u8; suite.key_len()]);
            argon2
                .hash_password_into(passphrase.as_bytes(), salt, &mut key)
                .map_err(|e| CodecError::DerivationFailure(format!("argon2 failed: {e}")))?;

            Ok(KeyMaterial {
                key,
                salt: *salt,
                derivation: KeyDerivation::Argon2id(kdf),
            })
        }
    }
}
