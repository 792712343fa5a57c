//! The boundary between the storage manager and the codec.
//!
//! [`PagerAdapter`] owns a page store and at most one codec. Every page that
//! goes to disk passes through `transform_write`, every page read comes back
//! through `transform_read`. With no codec attached pages pass through
//! untouched.

use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::codec::{Codec, CodecContext, PageGeometry, PageNo};
use crate::crypto::{KeyMaterial, SuiteId, registry};
use crate::error::{CodecError, Result};
use crate::storage::PageStore;

/// Page operations the storage manager asks the codec for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecOp {
    /// A main database page was read.
    ReadMain,
    /// A main database page is about to be written.
    WriteMain,
    /// A page is about to be written to the rollback journal.
    WriteJournal,
}

impl CodecOp {
    /// Maps the classic pager op codes (3, 6, 7).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            3 => Some(CodecOp::ReadMain),
            6 => Some(CodecOp::WriteMain),
            7 => Some(CodecOp::WriteJournal),
            _ => None,
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, CodecOp::ReadMain)
    }
}

pub struct PagerAdapter<S: PageStore> {
    store: S,
    codec: Option<Box<dyn Codec>>,
    geometry: PageGeometry,
}

impl<S: PageStore> PagerAdapter<S> {
    /// Wraps `store` with `reserved` trailer bytes per page and no codec.
    pub fn new(store: S, reserved: usize) -> Self {
        let geometry = PageGeometry::new(store.page_size(), reserved);
        Self {
            store,
            codec: None,
            geometry,
        }
    }

    pub fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn get_codec(&self) -> Option<&dyn Codec> {
        self.codec.as_deref()
    }

    pub fn has_codec(&self) -> bool {
        self.codec.is_some()
    }

    /// Installs `codec` and hands back the one it replaces. The previous
    /// codec is not released; that is the caller's decision.
    ///
    /// A codec built for a different geometry is refused with
    /// [`CodecError::InvalidPageGeometry`] and the installed one stays.
    pub fn set_codec(&mut self, codec: Box<dyn Codec>) -> Result<Option<Box<dyn Codec>>> {
        let theirs = codec.geometry();
        if theirs != self.geometry {
            return Err(CodecError::InvalidPageGeometry {
                page_size: theirs.page_size(),
                reserved: theirs.reserved(),
                reason: "codec geometry does not match the pager",
            });
        }
        debug!(suite = codec.suite().name(), "codec installed");
        Ok(self.codec.replace(codec))
    }

    /// Builds a codec for `suite` over the current geometry and installs it,
    /// releasing any codec it replaces.
    pub fn attach(&mut self, suite: SuiteId, key: KeyMaterial) -> Result<()> {
        let ctx = CodecContext::attach(registry().get(suite), key, self.geometry)?;
        if let Some(mut old) = self.set_codec(Box::new(ctx))? {
            old.release();
        }
        Ok(())
    }

    /// Removes the codec without releasing it.
    pub fn detach(&mut self) -> Option<Box<dyn Codec>> {
        self.codec.take()
    }

    /// Removes and releases the codec, if any.
    pub fn free(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            codec.release();
        }
    }

    /// Changes page size and reserved bytes.
    ///
    /// The codec is told first; if it refuses the change, nothing changes.
    /// A populated store keeps its page size, so only the reserved bytes may
    /// change then.
    pub fn set_page_size(&mut self, page_size: usize, reserved: usize) -> Result<()> {
        let previous = self.geometry;
        if let Some(codec) = self.codec.as_deref_mut() {
            codec.on_geometry_change(page_size, reserved)?;
        }
        if let Err(e) = self.store.set_page_size(page_size) {
            debug!(error = %e, "store refused page size change");
            if let Some(codec) = self.codec.as_deref_mut() {
                codec.on_geometry_change(previous.page_size(), previous.reserved())?;
            }
            return Err(CodecError::PageSizeMismatch {
                expected: self.store.page_size(),
                actual: page_size,
            });
        }
        info!(page_size, reserved, "page geometry changed");
        self.geometry = PageGeometry::new(page_size, reserved);
        Ok(())
    }

    /// Runs one codec operation on `page` and returns the bytes the storage
    /// manager should use: the decrypted page for reads, the encrypted copy
    /// for writes. `page` itself is only modified by reads.
    pub fn dispatch<'a>(
        &'a mut self,
        op: CodecOp,
        page_no: PageNo,
        page: &'a mut [u8],
    ) -> Result<&'a [u8]> {
        let Some(codec) = self.codec.as_deref_mut() else {
            return Ok(page);
        };
        match op {
            CodecOp::ReadMain => {
                codec.transform_read(page_no, page)?;
                Ok(page)
            }
            CodecOp::WriteMain | CodecOp::WriteJournal => codec.transform_write(page_no, page),
        }
    }

    /// Reads and decrypts page `page_no` into `buf`.
    pub fn read_page(&mut self, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        if page_no == 0 {
            return Err(CodecError::InvalidPageNumber(page_no));
        }
        self.store.read_page(page_no, buf)?;
        if let Some(codec) = self.codec.as_deref_mut() {
            codec.transform_read(page_no, buf)?;
        }
        Ok(())
    }

    /// Encrypts and writes `data` as page `page_no`. `data` is left as is.
    pub fn write_page(&mut self, page_no: PageNo, data: &[u8]) -> Result<()> {
        if page_no == 0 {
            return Err(CodecError::InvalidPageNumber(page_no));
        }
        match self.codec.as_deref_mut() {
            Some(codec) => {
                let encrypted = codec.transform_write(page_no, data)?;
                self.store.write_page(page_no, encrypted)?;
            }
            None => self.store.write_page(page_no, data)?,
        }
        Ok(())
    }

    /// Reads a page, decrypted, into a fresh buffer.
    pub fn read_page_vec(&mut self, page_no: PageNo) -> Result<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(vec![0u8; self.geometry.page_size()]);
        self.read_page(page_no, &mut buf)?;
        Ok(buf)
    }

    /// Borrows the store and the codec at the same time.
    pub(crate) fn parts_mut(&mut self) -> (&mut S, Option<&mut (dyn Codec + 'static)>) {
        (&mut self.store, self.codec.as_deref_mut())
    }

    /// Frees the codec and returns the store.
    pub fn into_store(mut self) -> S {
        self.free();
        self.store
    }
}

impl<S: PageStore + std::fmt::Debug> std::fmt::Debug for PagerAdapter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagerAdapter")
            .field("store", &self.store)
            .field("codec", &self.codec.as_ref().map(|c| c.suite().name()))
            .field("geometry", &self.geometry)
            .finish()
    }
}
