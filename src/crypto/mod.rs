//! Cryptographic building blocks for the page codec.
//!
//! Provides the cipher-suite abstraction and its registry, the concrete
//! suites, and passphrase based key derivation.

pub mod aead;
pub mod cbc;
pub mod kdf;
pub mod suite;

use getrandom::fill;

use crate::error::{CodecError, Result};

pub use kdf::{KdfParams, KeyDerivation, KeyMaterial, Secret, derive_key, generate_salt};
pub use suite::{CipherSuite, SuiteId, SuiteRegistry, registry};

/// Length of the per-database salt (16 bytes).
pub const SALT_LEN: usize = 16;
/// Length of a 256-bit cipher key.
pub const KEY_LEN: usize = 32;
/// Length of a Poly1305 / GCM authentication tag.
pub const TAG_LEN: usize = 16;
/// Length of the big-endian page number mixed into nonces and associated data.
pub const PAGE_NO_LEN: usize = 4;
/// Length of the key check value stored in the page-1 header.
pub const KEY_CHECK_LEN: usize = 8;

/// Fill buffer with cryptographically secure random bytes
pub(crate) fn secure_random(buf: &mut [u8]) -> Result<()> {
    fill(buf).map_err(|_| CodecError::Entropy)
}

/// Fails unless `key` has exactly the length `suite` requires.
pub(crate) fn check_key_len(suite: &dyn CipherSuite, key: &[u8]) -> Result<()> {
    if key.len() != suite.key_len() {
        return Err(CodecError::KeyLengthMismatch {
            expected: suite.key_len(),
            actual: key.len(),
        });
    }
    Ok(())
}
