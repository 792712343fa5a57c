//! Codec header v1.
//!
//! V1 layout (48 bytes, little endian):
//! ```text
//! MAGIC (4) | VERSION (1) | CIPHER (1) | KDF (1) | RESERVED (1) | PAGE_SIZE (4)
//! | MEM_COST (4) | ITERATIONS (4) | PARALLELISM (4) | SALT (16) | KEY_CHECK (8)
//! ```
//! For raw keys the three cost fields are zero.

use super::{CODEC_HEADER_LEN, CodecHeader, MAGIC, MAGIC_LEN, VER_LEN};
use crate::codec::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::crypto::{KEY_CHECK_LEN, KdfParams, KeyDerivation, SALT_LEN, SuiteId};
use crate::error::{CodecError, Result};

/// Current file format version.
pub const VERSION_V1: u8 = 1;

const CIPHER_LEN: usize = 1;
const KDF_LEN: usize = 1;
const RESERVED_LEN: usize = 1;
const PAGE_SIZE_LEN: usize = 4;
const MEM_LEN: usize = 4;
const TIME_LEN: usize = 4;
const PAR_LEN: usize = 4;

const USED_LEN: usize = MAGIC_LEN
    + VER_LEN
    + CIPHER_LEN
    + KDF_LEN
    + RESERVED_LEN
    + PAGE_SIZE_LEN
    + MEM_LEN
    + TIME_LEN
    + PAR_LEN
    + SALT_LEN
    + KEY_CHECK_LEN;

const _: () = assert!(USED_LEN == CODEC_HEADER_LEN);

fn invalid(msg: impl Into<String>) -> CodecError {
    CodecError::InvalidHeader(msg.into())
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes: [u8; 4] = data[*offset..*offset + 4]
        .try_into()
        .map_err(|_| invalid("truncated field"))?;
    *offset += 4;
    Ok(u32::from_le_bytes(bytes))
}

/// Parses a v1 codec header.
///
/// # Errors
///
/// Returns an error if the data is too short, names an unknown cipher or
/// key derivation, or carries invalid parameters. A page size outside
/// `512..=65536` or not a power of two is rejected here so nothing
/// downstream ever sees one.
pub fn parse(data: &[u8]) -> Result<CodecHeader> {
    if data.len() < CODEC_HEADER_LEN {
        return Err(invalid("header too short for v1"));
    }

    let mut offset = MAGIC_LEN + VER_LEN;

    let suite = SuiteId::from_wire_id(data[offset])?;
    offset += CIPHER_LEN;

    let kdf_id = data[offset];
    offset += KDF_LEN;

    let reserved = data[offset];
    offset += RESERVED_LEN;

    let page_size = read_u32(data, &mut offset)?;
    if !page_size.is_power_of_two()
        || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&(page_size as usize))
    {
        return Err(invalid(format!("unusable page size {page_size}")));
    }
    let mem_cost = read_u32(data, &mut offset)?;
    let time_cost = read_u32(data, &mut offset)?;
    let parallelism = read_u32(data, &mut offset)?;

    let salt: [u8; SALT_LEN] = data[offset..offset + SALT_LEN]
        .try_into()
        .map_err(|_| invalid("invalid salt length"))?;
    offset += SALT_LEN;

    let key_check: [u8; KEY_CHECK_LEN] = data[offset..offset + KEY_CHECK_LEN]
        .try_into()
        .map_err(|_| invalid("invalid key check length"))?;

    let derivation = match kdf_id {
        KeyDerivation::RAW_ID => KeyDerivation::Raw,
        KeyDerivation::ARGON2ID_ID => {
            KeyDerivation::Argon2id(KdfParams::new(mem_cost, time_cost, parallelism)?)
        }
        other => return Err(invalid(format!("unknown key derivation id {other}"))),
    };

    Ok(CodecHeader {
        version: VERSION_V1,
        suite,
        derivation,
        reserved,
        page_size,
        salt,
        key_check,
    })
}

/// Writes a v1 header into `out`.
///
/// # Errors
///
/// Returns an error if the header is not v1 or `out` has the wrong length.
pub fn serialize_into(header: &CodecHeader, out: &mut [u8]) -> Result<()> {
    if header.version() != VERSION_V1 {
        return Err(invalid("wrong version for v1 serializer"));
    }

    if out.len() != CODEC_HEADER_LEN {
        return Err(invalid("output buffer must be exactly one header long"));
    }

    let (mem, time, par) = match header.derivation() {
        KeyDerivation::Raw => (0, 0, 0),
        KeyDerivation::Argon2id(kdf) => (kdf.mem_cost_kib(), kdf.time_cost(), kdf.parallelism()),
    };

    out.fill(0);
    out[..MAGIC_LEN].copy_from_slice(MAGIC);
    let mut offset = MAGIC_LEN;
    out[offset] = VERSION_V1;
    offset += VER_LEN;
    out[offset] = header.suite().wire_id();
    offset += CIPHER_LEN;
    out[offset] = header.derivation().id();
    offset += KDF_LEN;
    out[offset] = header.reserved();
    offset += RESERVED_LEN;

    for value in [header.page_size(), mem, time, par] {
        out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        offset += 4;
    }

    out[offset..offset + SALT_LEN].copy_from_slice(header.salt());
    offset += SALT_LEN;
    out[offset..offset + KEY_CHECK_LEN].copy_from_slice(header.key_check());

    Ok(())
}
