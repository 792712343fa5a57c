//! Page stores standing in for the storage manager's I/O and transaction
//! layer.
//!
//! The codec only needs whole-page reads and writes plus an exclusive
//! transaction to hang a rekey on. [`MemoryStore`] keeps pages in memory
//! with an undo journal; [`FileStore`] backs the same thing with a file
//! that is replaced atomically on every commit.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use getrandom::fill;

use crate::codec::PageNo;

/// Whole-page I/O with begin/commit/rollback.
///
/// Writes outside a transaction are applied immediately. Page `n + 1` may be
/// written to grow a store of `n` pages; anything further is an error.
pub trait PageStore {
    fn page_size(&self) -> usize;

    fn page_count(&self) -> PageNo;

    fn read_page(&self, page_no: PageNo, buf: &mut [u8]) -> io::Result<()>;

    fn write_page(&mut self, page_no: PageNo, data: &[u8]) -> io::Result<()>;

    /// Changes the page size. Only an empty store may change it.
    fn set_page_size(&mut self, page_size: usize) -> io::Result<()>;

    /// Starts an exclusive transaction.
    fn begin(&mut self) -> io::Result<()>;

    fn commit(&mut self) -> io::Result<()>;

    /// Restores every page written since [`begin`](Self::begin).
    fn rollback(&mut self) -> io::Result<()>;
}

fn invalid_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// In-memory page store with an undo journal.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    page_size: usize,
    pages: Vec<Vec<u8>>,
    /// Original contents of pages touched in the open transaction; `None`
    /// marks a page that did not exist before it.
    journal: Option<BTreeMap<PageNo, Option<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Vec::new(),
            journal: None,
        }
    }

    /// Builds a store from raw file contents.
    pub fn from_bytes(page_size: usize, data: &[u8]) -> io::Result<Self> {
        if page_size == 0 || data.len() % page_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "file length {} is not a multiple of page size {page_size}",
                    data.len()
                ),
            ));
        }
        Ok(Self {
            page_size,
            pages: data.chunks(page_size).map(<[u8]>::to_vec).collect(),
            journal: None,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.pages.concat()
    }

    /// Raw on-disk bytes of a page.
    pub fn raw_page(&self, page_no: PageNo) -> Option<&[u8]> {
        let idx = (page_no as usize).checked_sub(1)?;
        self.pages.get(idx).map(Vec::as_slice)
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    fn check_len(&self, len: usize) -> io::Result<()> {
        if len != self.page_size {
            return Err(invalid_input(format!(
                "page buffer is {len} bytes, page size is {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

impl PageStore for MemoryStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> PageNo {
        self.pages.len() as PageNo
    }

    fn read_page(&self, page_no: PageNo, buf: &mut [u8]) -> io::Result<()> {
        self.check_len(buf.len())?;
        let page = self.raw_page(page_no).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("page {page_no} does not exist"),
            )
        })?;
        buf.copy_from_slice(page);
        Ok(())
    }

    fn write_page(&mut self, page_no: PageNo, data: &[u8]) -> io::Result<()> {
        self.check_len(data.len())?;
        let count = self.page_count();
        if page_no == 0 || page_no > count + 1 {
            return Err(invalid_input(format!(
                "cannot write page {page_no} to a store of {count} pages"
            )));
        }

        let idx = page_no as usize - 1;
        if let Some(journal) = self.journal.as_mut() {
            journal
                .entry(page_no)
                .or_insert_with(|| self.pages.get(idx).cloned());
        }

        if page_no == count + 1 {
            self.pages.push(data.to_vec());
        } else {
            self.pages[idx].copy_from_slice(data);
        }
        Ok(())
    }

    fn set_page_size(&mut self, page_size: usize) -> io::Result<()> {
        if page_size == self.page_size {
            return Ok(());
        }
        if !self.pages.is_empty() {
            return Err(invalid_input(format!(
                "cannot change page size of a store holding {} pages",
                self.pages.len()
            )));
        }
        self.page_size = page_size;
        Ok(())
    }

    fn begin(&mut self) -> io::Result<()> {
        if self.journal.is_some() {
            return Err(io::Error::other("transaction already open"));
        }
        self.journal = Some(BTreeMap::new());
        Ok(())
    }

    fn commit(&mut self) -> io::Result<()> {
        self.journal
            .take()
            .map(|_| ())
            .ok_or_else(|| io::Error::other("no open transaction"))
    }

    fn rollback(&mut self) -> io::Result<()> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| io::Error::other("no open transaction"))?;

        // Newly appended pages come last, so truncating at the first one
        // removes them all.
        let mut truncate_at = None;
        for (page_no, original) in journal {
            let idx = page_no as usize - 1;
            match original {
                Some(bytes) => self.pages[idx] = bytes,
                None => {
                    truncate_at.get_or_insert(idx);
                }
            }
        }
        if let Some(idx) = truncate_at {
            self.pages.truncate(idx);
        }
        Ok(())
    }
}

/// A file-backed page store.
///
/// Pages are held in memory; every commit (or every write outside a
/// transaction) rewrites the file atomically, so a crash leaves either the
/// old or the new file, never a mix.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    pages: MemoryStore,
}

impl FileStore {
    /// Creates an empty store; fails if the file exists.
    pub fn create(path: PathBuf, page_size: usize) -> io::Result<Self> {
        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        Ok(Self {
            path,
            pages: MemoryStore::new(page_size),
        })
    }

    /// Opens an existing file with the given page size.
    pub fn open(path: PathBuf, page_size: usize) -> io::Result<Self> {
        let data = fs::read(&path)?;
        let pages = MemoryStore::from_bytes(page_size, &data)?;
        Ok(Self { path, pages })
    }

    /// Returns `true` if the storage file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Returns the path to the storage file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves data to the storage file using atomic write.
    ///
    /// 1. Writes data to a temporary file with random name
    /// 2. Syncs the temporary file to disk
    /// 3. Atomically replaces the old file with the new one
    /// 4. Syncs the parent directory to ensure the rename is persisted
    ///
    /// Creates parent directories if they don't exist.
    fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.random_tmp_path()?;

        // securely create temp file (fail if exists)
        let mut tmp_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;

        tmp_file.write_all(&self.pages.to_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        if let Err(e) = self.atomic_replace(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }

        Ok(())
    }

    /// Generates a unique temporary file path in the same directory.
    ///
    /// Format: `filename.tmp.<randomhex>`
    fn random_tmp_path(&self) -> io::Result<PathBuf> {
        let mut buf = [0u8; 8]; // 64 bit entropy
        fill(&mut buf).map_err(|_| io::Error::other("OS random generator unavailable"))?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| invalid_input(format!("{} has no file name", self.path.display())))?
            .to_string_lossy();

        Ok(self
            .path
            .with_file_name(format!("{file_name}.tmp.{}", hex::encode(buf))))
    }

    /// Atomically replaces the target file with the temporary file.
    ///
    /// Uses Windows `ReplaceFileW` API with `REPLACEFILE_WRITE_THROUGH` flag
    /// to ensure the operation is truly atomic and persisted to disk.
    #[cfg(target_os = "windows")]
    fn atomic_replace(&self, tmp_path: &Path) -> io::Result<()> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::Win32::Storage::FileSystem::{REPLACEFILE_WRITE_THROUGH, ReplaceFileW};

        if !self.path.exists() {
            return fs::rename(tmp_path, &self.path);
        }

        fn to_wide(s: &OsStr) -> Vec<u16> {
            s.encode_wide().chain(std::iter::once(0)).collect()
        }

        let target_w = to_wide(self.path.as_os_str());
        let tmp_w = to_wide(tmp_path.as_os_str());

        // SAFETY:
        // - Strings are valid UTF-16 and null-terminated
        // - Pointers remain valid during the call
        // - Windows does not retain the pointers after return
        let result = unsafe {
            ReplaceFileW(
                target_w.as_ptr(),
                tmp_w.as_ptr(),
                std::ptr::null(),
                REPLACEFILE_WRITE_THROUGH,
                std::ptr::null(),
                std::ptr::null(),
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Atomically replaces the target file with the temporary file.
    ///
    /// On Unix, `rename()` is atomic when both paths are on the same filesystem.
    #[cfg(not(target_os = "windows"))]
    fn atomic_replace(&self, tmp_path: &Path) -> io::Result<()> {
        fs::rename(tmp_path, &self.path)
    }
}

impl PageStore for FileStore {
    fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    fn page_count(&self) -> PageNo {
        self.pages.page_count()
    }

    fn read_page(&self, page_no: PageNo, buf: &mut [u8]) -> io::Result<()> {
        self.pages.read_page(page_no, buf)
    }

    fn write_page(&mut self, page_no: PageNo, data: &[u8]) -> io::Result<()> {
        self.pages.write_page(page_no, data)?;
        if !self.pages.in_transaction() {
            self.save()?;
        }
        Ok(())
    }

    fn set_page_size(&mut self, page_size: usize) -> io::Result<()> {
        self.pages.set_page_size(page_size)
    }

    fn begin(&mut self) -> io::Result<()> {
        self.pages.begin()
    }

    fn commit(&mut self) -> io::Result<()> {
        // The file is replaced before the journal is dropped so a failed
        // save can still be rolled back in memory.
        if !self.pages.in_transaction() {
            return Err(io::Error::other("no open transaction"));
        }
        self.save()?;
        self.pages.commit()
    }

    fn rollback(&mut self) -> io::Result<()> {
        self.pages.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // --------------------------------------------------
    // MEMORY STORE
    // --------------------------------------------------

    #[test]
    fn pages_append_and_overwrite() {
        let mut store = MemoryStore::new(512);
        store.write_page(1, &[1u8; 512]).unwrap();
        store.write_page(2, &[2u8; 512]).unwrap();
        store.write_page(1, &[3u8; 512]).unwrap();

        let mut buf = [0u8; 512];
        store.read_page(1, &mut buf).unwrap();
        assert_eq!(buf, [3u8; 512]);
        assert_eq!(store.page_count(), 2);
    }

    #[test]
    fn gaps_and_wrong_sizes_are_rejected() {
        let mut store = MemoryStore::new(512);
        assert!(store.write_page(2, &[0u8; 512]).is_err());
        assert!(store.write_page(0, &[0u8; 512]).is_err());
        assert!(store.write_page(1, &[0u8; 100]).is_err());
        assert!(store.read_page(1, &mut [0u8; 512]).is_err());
    }

    #[test]
    fn rollback_restores_and_truncates() {
        let mut store = MemoryStore::new(512);
        store.write_page(1, &[1u8; 512]).unwrap();
        store.write_page(2, &[2u8; 512]).unwrap();
        let before = store.to_bytes();

        store.begin().unwrap();
        store.write_page(2, &[9u8; 512]).unwrap();
        store.write_page(2, &[8u8; 512]).unwrap();
        store.write_page(3, &[7u8; 512]).unwrap();
        store.write_page(4, &[6u8; 512]).unwrap();
        store.rollback().unwrap();

        assert_eq!(store.to_bytes(), before);
        assert!(!store.in_transaction());
    }

    #[test]
    fn page_size_is_fixed_once_populated() {
        let mut store = MemoryStore::new(512);
        store.set_page_size(1024).unwrap();
        store.write_page(1, &[0u8; 1024]).unwrap();
        store.set_page_size(1024).unwrap();
        assert!(store.set_page_size(2048).is_err());
    }

    #[test]
    fn commit_keeps_changes() {
        let mut store = MemoryStore::new(512);
        store.write_page(1, &[1u8; 512]).unwrap();
        store.begin().unwrap();
        assert!(store.begin().is_err());
        store.write_page(1, &[5u8; 512]).unwrap();
        store.commit().unwrap();
        assert_eq!(store.raw_page(1).unwrap(), &[5u8; 512]);
        assert!(store.commit().is_err());
        assert!(store.rollback().is_err());
    }

    // --------------------------------------------------
    // FILE STORE
    // --------------------------------------------------

    #[test]
    fn writes_outside_transaction_hit_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.pgc");

        let mut store = FileStore::create(path.clone(), 512).unwrap();
        assert!(!store.exists());
        store.write_page(1, &[4u8; 512]).unwrap();
        assert!(store.exists());

        let reopened = FileStore::open(path, 512).unwrap();
        assert_eq!(reopened.page_count(), 1);
        let mut buf = [0u8; 512];
        reopened.read_page(1, &mut buf).unwrap();
        assert_eq!(buf, [4u8; 512]);
    }

    #[test]
    fn transaction_is_persisted_only_on_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.pgc");

        let mut store = FileStore::create(path.clone(), 512).unwrap();
        store.write_page(1, &[1u8; 512]).unwrap();

        store.begin().unwrap();
        store.write_page(1, &[2u8; 512]).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![1u8; 512]);
        store.commit().unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![2u8; 512]);

        store.begin().unwrap();
        store.write_page(2, &[3u8; 512]).unwrap();
        store.rollback().unwrap();
        assert_eq!(store.page_count(), 1);
        assert_eq!(fs::read(&path).unwrap(), vec![2u8; 512]);
    }

    #[test]
    fn create_fails_if_file_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.pgc");
        fs::write(&path, b"x").unwrap();
        assert!(FileStore::create(path, 512).is_err());
    }

    #[test]
    fn open_rejects_partial_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.pgc");
        fs::write(&path, vec![0u8; 700]).unwrap();
        assert!(FileStore::open(path, 512).is_err());
    }

    #[test]
    fn tmp_file_is_removed_after_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.pgc");
        let mut store = FileStore::create(path, 512).unwrap();
        store.write_page(1, &[0u8; 512]).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], "db.pgc");
    }

    #[test]
    fn tmp_names_are_unique() {
        let dir = tempdir().unwrap();
        let store = FileStore::create(dir.path().join("db.pgc"), 512).unwrap();

        let a = store.random_tmp_path().unwrap();
        let b = store.random_tmp_path().unwrap();

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path()));
    }

    #[test]
    fn parent_directory_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("db.pgc");

        let mut store = FileStore::create(nested.clone(), 512).unwrap();
        store.write_page(1, &[0u8; 512]).unwrap();

        assert!(nested.exists());
    }
}
