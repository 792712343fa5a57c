//! AES-256-CBC suites, with and without an HMAC-SHA256 trailer.

use ::cbc::cipher::block_padding::NoPadding;
use ::cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::{CipherSuite, KEY_LEN, KeyMaterial, PAGE_NO_LEN, SuiteId, check_key_len, secure_random};
use crate::error::{CodecError, Result};

type Aes256CbcEnc = ::cbc::Encryptor<Aes256>;
type Aes256CbcDec = ::cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block and IV length (16 bytes).
pub const BLOCK_LEN: usize = 16;
/// Length of an HMAC-SHA256 tag.
pub const MAC_LEN: usize = 32;

pub static AES_256_CBC: Aes256CbcSuite = Aes256CbcSuite;
pub static AES_256_CBC_HMAC_SHA256: Aes256CbcHmacSuite = Aes256CbcHmacSuite;

fn misaligned(len: usize) -> CodecError {
    CodecError::InvalidPageGeometry {
        page_size: len,
        reserved: 0,
        reason: "encrypted region is not a multiple of the AES block size",
    }
}

fn cbc_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let len = data.len();
    Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CodecError::KeyLengthMismatch {
            expected: KEY_LEN,
            actual: key.len(),
        })?
        .encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|_| misaligned(len))?;
    Ok(())
}

fn cbc_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let len = data.len();
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CodecError::KeyLengthMismatch {
            expected: KEY_LEN,
            actual: key.len(),
        })?
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| misaligned(len))?;
    Ok(())
}

/// Unauthenticated AES-256-CBC. No trailer; the IV is
/// `SHA-256(key || be_u32(page_no))[..16]`, so equal plaintexts on
/// different pages encrypt differently. Tampering and wrong keys are not
/// detected.
#[derive(Debug)]
pub struct Aes256CbcSuite;

impl Aes256CbcSuite {
    fn page_iv(key: &[u8], page_no: u32) -> [u8; BLOCK_LEN] {
        let digest = Sha256::new()
            .chain_update(key)
            .chain_update(page_no.to_be_bytes())
            .finalize();
        let mut iv = [0u8; BLOCK_LEN];
        iv.copy_from_slice(&digest[..BLOCK_LEN]);
        iv
    }
}

impl CipherSuite for Aes256CbcSuite {
    fn id(&self) -> SuiteId {
        SuiteId::Aes256Cbc
    }

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn reserved_bytes(&self) -> usize {
        0
    }

    fn block_size(&self) -> usize {
        BLOCK_LEN
    }

    fn is_authenticated(&self) -> bool {
        false
    }

    fn encrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        _prefix: &[u8],
        data: &mut [u8],
        _trailer: &mut [u8],
    ) -> Result<()> {
        check_key_len(self, key.as_bytes())?;
        let iv = Self::page_iv(key.as_bytes(), page_no);
        cbc_encrypt(key.as_bytes(), &iv, data)
    }

    fn decrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        _prefix: &[u8],
        data: &mut [u8],
        _trailer: &[u8],
    ) -> Result<()> {
        check_key_len(self, key.as_bytes())?;
        let iv = Self::page_iv(key.as_bytes(), page_no);
        cbc_decrypt(key.as_bytes(), &iv, data)
    }
}

/// AES-256-CBC followed by HMAC-SHA256 (encrypt-then-MAC).
///
/// Key is 64 bytes: cipher key then MAC key. Trailer layout:
/// ```text
/// | IV: random(12) || be_u32(page_no) (16) | HMAC (32) |
/// ```
/// The MAC covers `ciphertext || IV || be_u32(page_no) || prefix`.
#[derive(Debug)]
pub struct Aes256CbcHmacSuite;

impl Aes256CbcHmacSuite {
    fn mac(
        mac_key: &[u8],
        page_no: u32,
        prefix: &[u8],
        ciphertext: &[u8],
        iv: &[u8],
    ) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| {
            CodecError::KeyLengthMismatch {
                expected: KEY_LEN,
                actual: mac_key.len(),
            }
        })?;
        mac.update(ciphertext);
        mac.update(iv);
        mac.update(&page_no.to_be_bytes());
        mac.update(prefix);
        Ok(mac)
    }
}

impl CipherSuite for Aes256CbcHmacSuite {
    fn id(&self) -> SuiteId {
        SuiteId::Aes256CbcHmacSha256
    }

    fn key_len(&self) -> usize {
        2 * KEY_LEN
    }

    fn reserved_bytes(&self) -> usize {
        BLOCK_LEN + MAC_LEN
    }

    fn block_size(&self) -> usize {
        BLOCK_LEN
    }

    fn is_authenticated(&self) -> bool {
        true
    }

    fn encrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        prefix: &[u8],
        data: &mut [u8],
        trailer: &mut [u8],
    ) -> Result<()> {
        check_key_len(self, key.as_bytes())?;
        let (enc_key, mac_key) = key.as_bytes().split_at(KEY_LEN);
        let (iv, tag) = trailer.split_at_mut(BLOCK_LEN);

        secure_random(&mut iv[..BLOCK_LEN - PAGE_NO_LEN])?;
        iv[BLOCK_LEN - PAGE_NO_LEN..].copy_from_slice(&page_no.to_be_bytes());

        cbc_encrypt(enc_key, iv, data)?;
        let mac = Self::mac(mac_key, page_no, prefix, data, iv)?;
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(())
    }

    fn decrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        prefix: &[u8],
        data: &mut [u8],
        trailer: &[u8],
    ) -> Result<()> {
        check_key_len(self, key.as_bytes())?;
        let (enc_key, mac_key) = key.as_bytes().split_at(KEY_LEN);
        let (iv, tag) = trailer.split_at(BLOCK_LEN);

        Self::mac(mac_key, page_no, prefix, data, iv)?
            .verify_slice(tag)
            .map_err(|_| CodecError::AuthenticationFailure { page: page_no })?;
        cbc_decrypt(enc_key, iv, data)
    }
}
