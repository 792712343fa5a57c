//! Per-connection codec context and the `Codec` trait the pager drives.
//!
//! Page layout seen by the codec:
//! ```text
//! page 1:  | header (48, clear) | encrypted ...      | extra reserved | suite trailer |
//! page n:  | encrypted ...                           | extra reserved | suite trailer |
//!          |<------------- usable ----------------->|<------- reserved --------->|
//! ```

use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{CipherSuite, KEY_CHECK_LEN, KeyMaterial};
use crate::error::{CodecError, Result};
use crate::format::{self, CODEC_HEADER_LEN, CodecHeader};

pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;
/// Reserved bytes are stored in a single header byte.
pub const MAX_RESERVED: usize = 255;
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// 1-based page number assigned by the storage manager.
pub type PageNo = u32;

/// Page size and reserved trailer size, as dictated by the storage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    page_size: usize,
    reserved: usize,
}

impl PageGeometry {
    pub fn new(page_size: usize, reserved: usize) -> Self {
        Self {
            page_size,
            reserved,
        }
    }

    /// Geometry with exactly the trailer `suite` needs.
    pub fn for_suite(page_size: usize, suite: &dyn CipherSuite) -> Self {
        Self::new(page_size, suite.reserved_bytes())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Bytes in front of the reserved trailer.
    pub fn usable(&self) -> usize {
        self.page_size.saturating_sub(self.reserved)
    }

    /// Checks that pages of this shape can be encrypted by `suite`.
    pub fn validate(&self, suite: &dyn CipherSuite) -> Result<()> {
        let fail = |reason| {
            Err(CodecError::InvalidPageGeometry {
                page_size: self.page_size,
                reserved: self.reserved,
                reason,
            })
        };

        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return fail("page size must be a power of two between 512 and 65536");
        }
        if self.reserved > MAX_RESERVED {
            return fail("at most 255 reserved bytes per page");
        }
        if self.reserved < suite.reserved_bytes() {
            return fail("reserved bytes too small for the cipher trailer");
        }
        if self.usable() <= CODEC_HEADER_LEN {
            return fail("no room left after the page-1 header");
        }
        if self.usable() % suite.block_size() != 0 {
            return fail("usable page area is not a multiple of the cipher block size");
        }
        Ok(())
    }
}

/// The hooks a pager calls around page I/O.
///
/// `transform_read` and `transform_write` sit on the hot path: they must
/// not log and must not allocate beyond a scratch buffer reused across
/// calls.
pub trait Codec: Send {
    /// Decrypts a page just read from disk, in place.
    fn transform_read(&mut self, page_no: PageNo, page: &mut [u8]) -> Result<()>;

    /// Encrypts a page about to be written. The caller's buffer stays
    /// plaintext; the returned slice is valid until the next call.
    fn transform_write(&mut self, page_no: PageNo, page: &[u8]) -> Result<&[u8]>;

    /// Called whenever the pager changes page size or reserved bytes. On
    /// error the previous geometry stays in force.
    fn on_geometry_change(&mut self, page_size: usize, reserved: usize) -> Result<()>;

    /// Wipes key material and cipher state. Idempotent.
    fn release(&mut self);

    fn geometry(&self) -> PageGeometry;

    fn suite(&self) -> &'static dyn CipherSuite;

    /// The page-1 header this codec writes.
    fn header(&self) -> CodecHeader;
}

/// Per-connection codec state: suite, key material, geometry and the
/// scratch buffer writes are encrypted into.
pub struct CodecContext {
    suite: &'static dyn CipherSuite,
    key: KeyMaterial,
    key_check: [u8; KEY_CHECK_LEN],
    geometry: PageGeometry,
    scratch: Zeroizing<Vec<u8>>,
    released: bool,
}

impl CodecContext {
    /// Creates a context. Fails with [`CodecError::KeyLengthMismatch`] or
    /// [`CodecError::InvalidPageGeometry`]; nothing is created on failure.
    pub fn attach(
        suite: &'static dyn CipherSuite,
        key: KeyMaterial,
        geometry: PageGeometry,
    ) -> Result<Self> {
        if key.len() != suite.key_len() {
            return Err(CodecError::KeyLengthMismatch {
                expected: suite.key_len(),
                actual: key.len(),
            });
        }
        geometry.validate(suite)?;
        let key_check = key.check_value()?;

        debug!(
            suite = suite.name(),
            page_size = geometry.page_size(),
            reserved = geometry.reserved(),
            "codec attached"
        );

        Ok(Self {
            suite,
            key,
            key_check,
            geometry,
            scratch: Zeroizing::new(vec![0u8; geometry.page_size()]),
            released: false,
        })
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    fn check_page(&self, page_no: PageNo, len: usize) -> Result<()> {
        if self.released {
            return Err(CodecError::Released);
        }
        if page_no == 0 {
            return Err(CodecError::InvalidPageNumber(page_no));
        }
        if len != self.geometry.page_size() {
            return Err(CodecError::PageSizeMismatch {
                expected: self.geometry.page_size(),
                actual: len,
            });
        }
        Ok(())
    }

    /// Splits a page into `(prefix, data, trailer)`.
    fn regions<'p>(
        geometry: PageGeometry,
        suite_reserved: usize,
        page_no: PageNo,
        page: &'p mut [u8],
    ) -> (&'p mut [u8], &'p mut [u8], &'p mut [u8]) {
        let prefix_len = if page_no == 1 { CODEC_HEADER_LEN } else { 0 };
        let (body, reserved) = page.split_at_mut(geometry.usable());
        let (prefix, data) = body.split_at_mut(prefix_len);
        let trailer_start = reserved.len() - suite_reserved;
        let trailer = &mut reserved[trailer_start..];
        (prefix, data, trailer)
    }
}

impl Codec for CodecContext {
    fn transform_read(&mut self, page_no: PageNo, page: &mut [u8]) -> Result<()> {
        self.check_page(page_no, page.len())?;

        let (prefix, data, trailer) =
            Self::regions(self.geometry, self.suite.reserved_bytes(), page_no, page);
        self.suite.decrypt(&self.key, page_no, prefix, data, trailer)?;
        trailer.fill(0);
        Ok(())
    }

    fn transform_write(&mut self, page_no: PageNo, page: &[u8]) -> Result<&[u8]> {
        self.check_page(page_no, page.len())?;

        self.scratch.copy_from_slice(page);
        if page_no == 1 {
            format::serialize_into(&self.header(), &mut self.scratch[..CODEC_HEADER_LEN])?;
        }

        let (prefix, data, trailer) = Self::regions(
            self.geometry,
            self.suite.reserved_bytes(),
            page_no,
            &mut self.scratch,
        );
        self.suite.encrypt(&self.key, page_no, prefix, data, trailer)?;
        Ok(self.scratch.as_slice())
    }

    fn on_geometry_change(&mut self, page_size: usize, reserved: usize) -> Result<()> {
        if self.released {
            return Err(CodecError::Released);
        }
        let geometry = PageGeometry::new(page_size, reserved);
        geometry.validate(self.suite)?;

        if geometry != self.geometry {
            debug!(page_size, reserved, "codec geometry changed");
            self.scratch.zeroize();
            self.scratch.resize(page_size, 0);
            self.geometry = geometry;
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.key.wipe();
        self.scratch.zeroize();
        self.released = true;
        debug!(suite = self.suite.name(), "codec released");
    }

    fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    fn suite(&self) -> &'static dyn CipherSuite {
        self.suite
    }

    fn header(&self) -> CodecHeader {
        CodecHeader::new(
            self.suite.id(),
            self.key.derivation(),
            self.geometry.page_size() as u32,
            self.geometry.reserved() as u8,
            *self.key.salt(),
        )
        .with_key_check(self.key_check)
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CodecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("suite", &self.suite.name())
            .field("geometry", &self.geometry)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SuiteId, registry};

    fn key_for(id: SuiteId, byte: u8) -> KeyMaterial {
        let len = registry().get(id).key_len();
        KeyMaterial::raw(Zeroizing::new(vec![byte; len]), [5u8; 16])
    }

    fn context(id: SuiteId, page_size: usize) -> CodecContext {
        let suite = registry().get(id);
        CodecContext::attach(suite, key_for(id, 1), PageGeometry::for_suite(page_size, suite))
            .unwrap()
    }

    fn sample_page(page_size: usize, reserved: usize) -> Vec<u8> {
        let mut page: Vec<u8> = (0..page_size).map(|i| (i % 251) as u8).collect();
        page[page_size - reserved..].fill(0);
        page
    }

    #[test]
    fn roundtrip_every_suite() {
        for id in SuiteId::ALL {
            let mut ctx = context(id, 1024);
            let plain = sample_page(1024, ctx.geometry().reserved());

            let mut page = ctx.transform_write(7, &plain).unwrap().to_vec();
            assert_ne!(page, plain, "{id}");
            ctx.transform_read(7, &mut page).unwrap();
            assert_eq!(page, plain, "{id}");
        }
    }

    #[test]
    fn page_one_keeps_header_in_clear() {
        for id in SuiteId::ALL {
            let mut ctx = context(id, 1024);
            let plain = sample_page(1024, ctx.geometry().reserved());

            let mut page = ctx.transform_write(1, &plain).unwrap().to_vec();
            let header = format::parse(&page).unwrap();
            assert_eq!(header, ctx.header());
            assert_eq!(header.suite(), id);
            ctx.key().verify_check_value(header.key_check()).unwrap();

            ctx.transform_read(1, &mut page).unwrap();
            assert_eq!(format::parse(&page).unwrap(), ctx.header());
            assert_eq!(&page[CODEC_HEADER_LEN..], &plain[CODEC_HEADER_LEN..], "{id}");
        }
    }

    #[test]
    fn extra_reserved_bytes_pass_through() {
        let suite = registry().get(SuiteId::XChaCha20Poly1305);
        let mut ctx = CodecContext::attach(
            suite,
            key_for(SuiteId::XChaCha20Poly1305, 1),
            PageGeometry::new(512, 48),
        )
        .unwrap();

        let mut plain = vec![3u8; 512];
        plain[512 - 48..].fill(0);
        plain[464..472].copy_from_slice(b"reserved");

        let mut page = ctx.transform_write(2, &plain).unwrap().to_vec();
        assert_eq!(&page[464..472], b"reserved");
        ctx.transform_read(2, &mut page).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn identical_pages_encrypt_differently_per_page_number() {
        for id in SuiteId::ALL {
            let mut ctx = context(id, 512);
            let plain = sample_page(512, ctx.geometry().reserved());
            let a = ctx.transform_write(2, &plain).unwrap().to_vec();
            let b = ctx.transform_write(3, &plain).unwrap().to_vec();
            assert_ne!(a, b, "{id}");
        }
    }

    #[test]
    fn swapped_pages_fail_authentication() {
        let mut ctx = context(SuiteId::Aes256Gcm, 512);
        let plain = sample_page(512, ctx.geometry().reserved());
        let mut page = ctx.transform_write(2, &plain).unwrap().to_vec();
        assert!(matches!(
            ctx.transform_read(3, &mut page),
            Err(CodecError::AuthenticationFailure { page: 3 })
        ));
    }

    #[test]
    fn attach_rejects_wrong_key_length() {
        let suite = registry().get(SuiteId::Aes256CbcHmacSha256);
        let err = CodecContext::attach(
            suite,
            key_for(SuiteId::Aes256Gcm, 1),
            PageGeometry::for_suite(4096, suite),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CodecError::KeyLengthMismatch {
                expected: 64,
                actual: 32
            }
        ));
    }

    #[test]
    fn attach_rejects_reserved_smaller_than_trailer() {
        let suite = registry().get(SuiteId::XChaCha20Poly1305);
        let err = CodecContext::attach(
            suite,
            key_for(SuiteId::XChaCha20Poly1305, 1),
            PageGeometry::new(4096, 16),
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidPageGeometry { .. }));
    }

    #[test]
    fn geometry_change_to_512_succeeds_and_to_64_fails() {
        let suite = registry().get(SuiteId::Aes256CbcHmacSha256);
        let mut ctx = CodecContext::attach(
            suite,
            key_for(SuiteId::Aes256CbcHmacSha256, 1),
            PageGeometry::new(4096, 48),
        )
        .unwrap();

        ctx.on_geometry_change(512, 48).unwrap();
        assert_eq!(ctx.geometry(), PageGeometry::new(512, 48));

        let err = ctx.on_geometry_change(64, 48).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidPageGeometry {
                page_size: 64,
                reserved: 48,
                ..
            }
        ));
        assert_eq!(ctx.geometry().page_size(), 512);

        let plain = sample_page(512, 48);
        let mut page = ctx.transform_write(4, &plain).unwrap().to_vec();
        ctx.transform_read(4, &mut page).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn misaligned_usable_area_is_rejected_for_block_ciphers() {
        let suite = registry().get(SuiteId::Aes256Cbc);
        assert!(PageGeometry::new(512, 8).validate(suite).is_err());
        assert!(PageGeometry::new(512, 16).validate(suite).is_ok());
        // stream ciphers don't care about alignment
        let suite = registry().get(SuiteId::Aes256Gcm);
        assert!(PageGeometry::new(512, 29).validate(suite).is_ok());
    }

    #[test]
    fn wrong_buffer_size_and_page_zero_are_rejected() {
        let mut ctx = context(SuiteId::Aes256Gcm, 512);
        assert!(matches!(
            ctx.transform_write(2, &[0u8; 100]),
            Err(CodecError::PageSizeMismatch { expected: 512, actual: 100 })
        ));
        assert!(matches!(
            ctx.transform_write(0, &[0u8; 512]),
            Err(CodecError::InvalidPageNumber(0))
        ));
    }

    #[test]
    fn release_wipes_and_is_idempotent() {
        let mut ctx = context(SuiteId::XChaCha20Poly1305, 512);
        ctx.release();
        assert!(ctx.is_released());
        assert!(ctx.key().is_empty());
        ctx.release();

        assert!(matches!(
            ctx.transform_write(2, &[0u8; 512]),
            Err(CodecError::Released)
        ));
        assert!(matches!(
            ctx.on_geometry_change(1024, 40),
            Err(CodecError::Released)
        ));
    }
}
