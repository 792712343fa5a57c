//! AEAD suites: XChaCha20-Poly1305 and AES-256-GCM.
//!
//! Page layout for both:
//! ```text
//! | encrypted data | extra reserved (passed through) | nonce | tag (16) |
//! ```
//! The page number is part of every nonce and of the associated data, so a
//! page copied into another slot fails authentication.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::XChaCha20Poly1305;
use chacha20poly1305::aead::{self, AeadInPlace, KeyInit};

use super::{
    CipherSuite, KEY_LEN, KeyMaterial, PAGE_NO_LEN, SuiteId, TAG_LEN, check_key_len,
    secure_random,
};
use crate::error::{CodecError, Result};
use crate::format::CODEC_HEADER_LEN;

/// Length of the XChaCha20-Poly1305 nonce (24 bytes).
pub const XNONCE_LEN: usize = 24;
/// Length of the AES-GCM nonce (12 bytes).
pub const GCM_NONCE_LEN: usize = 12;

const AAD_MAX: usize = PAGE_NO_LEN + CODEC_HEADER_LEN;

pub static XCHACHA20_POLY1305: XChaCha20Poly1305Suite = XChaCha20Poly1305Suite;
pub static AES_256_GCM: Aes256GcmSuite = Aes256GcmSuite;

/// Builds `be_u32(page_no) || prefix` on the stack.
fn associated_data<'a>(page_no: u32, prefix: &[u8], buf: &'a mut [u8; AAD_MAX]) -> &'a [u8] {
    let len = PAGE_NO_LEN + prefix.len().min(CODEC_HEADER_LEN);
    buf[..PAGE_NO_LEN].copy_from_slice(&page_no.to_be_bytes());
    buf[PAGE_NO_LEN..len].copy_from_slice(&prefix[..len - PAGE_NO_LEN]);
    &buf[..len]
}

fn check_trailer(suite: &dyn CipherSuite, trailer: &[u8]) -> Result<()> {
    if trailer.len() != suite.reserved_bytes() {
        return Err(CodecError::InvalidPageGeometry {
            page_size: 0,
            reserved: trailer.len(),
            reason: "trailer does not match the cipher suite",
        });
    }
    Ok(())
}

fn seal<A: AeadInPlace>(
    cipher: &A,
    nonce: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag_out: &mut [u8],
) -> Result<()> {
    let len = data.len();
    let tag = cipher
        .encrypt_in_place_detached(aead::Nonce::<A>::from_slice(nonce), aad, data)
        .map_err(|_| CodecError::InvalidPageGeometry {
            page_size: len,
            reserved: 0,
            reason: "page too large for the cipher",
        })?;
    tag_out.copy_from_slice(&tag);
    Ok(())
}

fn open<A: AeadInPlace>(
    cipher: &A,
    page_no: u32,
    nonce: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8],
) -> Result<()> {
    cipher
        .decrypt_in_place_detached(
            aead::Nonce::<A>::from_slice(nonce),
            aad,
            data,
            aead::Tag::<A>::from_slice(tag),
        )
        .map_err(|_| CodecError::AuthenticationFailure { page: page_no })
}

/// XChaCha20-Poly1305 with nonce `random(20) || be_u32(page_no)`.
#[derive(Debug)]
pub struct XChaCha20Poly1305Suite;

impl XChaCha20Poly1305Suite {
    fn cipher(&self, key: &KeyMaterial) -> Result<XChaCha20Poly1305> {
        check_key_len(self, key.as_bytes())?;
        XChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
            CodecError::KeyLengthMismatch {
                expected: KEY_LEN,
                actual: key.len(),
            }
        })
    }
}

impl CipherSuite for XChaCha20Poly1305Suite {
    fn id(&self) -> SuiteId {
        SuiteId::XChaCha20Poly1305
    }

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn reserved_bytes(&self) -> usize {
        XNONCE_LEN + TAG_LEN
    }

    fn block_size(&self) -> usize {
        1
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
        check_trailer(self, trailer)?;
        let cipher = self.cipher(key)?;

        let (nonce, tag) = trailer.split_at_mut(XNONCE_LEN);
        secure_random(&mut nonce[..XNONCE_LEN - PAGE_NO_LEN])?;
        nonce[XNONCE_LEN - PAGE_NO_LEN..].copy_from_slice(&page_no.to_be_bytes());

        let mut aad = [0u8; AAD_MAX];
        let aad = associated_data(page_no, prefix, &mut aad);
        seal(&cipher, nonce, aad, data, tag)
    }

    fn decrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        prefix: &[u8],
        data: &mut [u8],
        trailer: &[u8],
    ) -> Result<()> {
        check_trailer(self, trailer)?;
        let cipher = self.cipher(key)?;

        let (nonce, tag) = trailer.split_at(XNONCE_LEN);
        let mut aad = [0u8; AAD_MAX];
        let aad = associated_data(page_no, prefix, &mut aad);
        open(&cipher, page_no, nonce, aad, data, tag)
    }
}

/// AES-256-GCM with nonce `be_u32(page_no) || random(8)`.
#[derive(Debug)]
pub struct Aes256GcmSuite;

impl Aes256GcmSuite {
    fn cipher(&self, key: &KeyMaterial) -> Result<Aes256Gcm> {
        check_key_len(self, key.as_bytes())?;
        Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CodecError::KeyLengthMismatch {
            expected: KEY_LEN,
            actual: key.len(),
        })
    }
}

impl CipherSuite for Aes256GcmSuite {
    fn id(&self) -> SuiteId {
        SuiteId::Aes256Gcm
    }

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn reserved_bytes(&self) -> usize {
        GCM_NONCE_LEN + TAG_LEN
    }

    fn block_size(&self) -> usize {
        1
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
        check_trailer(self, trailer)?;
        let cipher = self.cipher(key)?;

        let (nonce, tag) = trailer.split_at_mut(GCM_NONCE_LEN);
        nonce[..PAGE_NO_LEN].copy_from_slice(&page_no.to_be_bytes());
        secure_random(&mut nonce[PAGE_NO_LEN..])?;

        let mut aad = [0u8; AAD_MAX];
        let aad = associated_data(page_no, prefix, &mut aad);
        seal(&cipher, nonce, aad, data, tag)
    }

    fn decrypt(
        &self,
        key: &KeyMaterial,
        page_no: u32,
        prefix: &[u8],
        data: &mut [u8],
        trailer: &[u8],
    ) -> Result<()> {
        check_trailer(self, trailer)?;
        let cipher = self.cipher(key)?;

        let (nonce, tag) = trailer.split_at(GCM_NONCE_LEN);
        let mut aad = [0u8; AAD_MAX];
        let aad = associated_data(page_no, prefix, &mut aad);
        open(&cipher, page_no, nonce, aad, data, tag)
    }
}
