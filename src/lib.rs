pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod format;
pub mod pager;
pub mod rekey;
pub mod storage;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zeroize::Zeroizing;

pub use crate::codec::{Codec, CodecContext, PageGeometry, PageNo};
pub use crate::config::CodecConfig;
pub use crate::crypto::{
    CipherSuite, KdfParams, KeyDerivation, KeyMaterial, Secret, SuiteId, registry,
};
pub use crate::error::{CodecError, Result};
pub use crate::format::{CODEC_HEADER_LEN, CodecHeader};
pub use crate::pager::{CodecOp, PagerAdapter};
pub use crate::rekey::{AbortHandle, RekeyCoordinator, RekeyReport, RekeyState, RekeyTarget};
pub use crate::storage::{FileStore, MemoryStore, PageStore};

/// A page store with a codec attached.
pub struct EncryptedDatabase<S: PageStore> {
    pager: PagerAdapter<S>,
    rekey: RekeyCoordinator,
}

impl<S: PageStore> EncryptedDatabase<S> {
    /// Encrypts an empty store as described by `config` and writes page 1.
    pub fn create(store: S, config: &CodecConfig) -> Result<Self> {
        config.validate()?;
        let secret = config.secret()?;
        Self::create_with(
            store,
            config.cipher,
            &secret,
            config.kdf_params()?,
            config.geometry(),
        )
    }

    pub fn create_with(
        mut store: S,
        suite: SuiteId,
        secret: &Secret,
        kdf: KdfParams,
        geometry: PageGeometry,
    ) -> Result<Self> {
        if store.page_count() != 0 {
            return Err(CodecError::InvalidConfig(
                "cannot create a database in a non-empty store".to_string(),
            ));
        }
        let cipher = registry().get(suite);
        geometry.validate(cipher)?;
        store.set_page_size(geometry.page_size())?;

        let salt = crypto::generate_salt()?;
        let key = crypto::derive_key(secret, &salt, kdf, cipher)?;

        let mut pager = PagerAdapter::new(store, geometry.reserved());
        pager.attach(suite, key)?;
        pager.write_page(1, &Zeroizing::new(vec![0u8; geometry.page_size()]))?;

        info!(
            %suite,
            page_size = geometry.page_size(),
            reserved = geometry.reserved(),
            "database created"
        );
        Ok(Self {
            pager,
            rekey: RekeyCoordinator::new(),
        })
    }

    /// Attaches a codec rebuilt from the page-1 header and `secret`.
    ///
    /// The derived key is checked against the header's key check value, so
    /// a wrong key fails here with [`CodecError::AuthenticationFailure`] for
    /// page 1, for every suite.
    pub fn open(store: S, secret: &Secret) -> Result<Self> {
        let header = read_store_header(&store)?;
        if header.page_size() as usize != store.page_size() {
            return Err(CodecError::InvalidHeader(format!(
                "header page size {} does not match store page size {}",
                header.page_size(),
                store.page_size()
            )));
        }

        let kdf = match (header.derivation(), secret) {
            (KeyDerivation::Argon2id(kdf), Secret::Passphrase(_)) => kdf,
            // ignored for raw keys
            (KeyDerivation::Raw, Secret::RawKey(_)) => KdfParams::default(),
            (KeyDerivation::Raw, Secret::Passphrase(_)) => {
                return Err(CodecError::InvalidConfig(
                    "database was created with a raw key".to_string(),
                ));
            }
            (KeyDerivation::Argon2id(_), Secret::RawKey(_)) => {
                return Err(CodecError::InvalidConfig(
                    "database was created with a passphrase".to_string(),
                ));
            }
        };

        let key = crypto::derive_key(secret, header.salt(), kdf, registry().get(header.suite()))?;
        key.verify_check_value(header.key_check())?;
        let mut pager = PagerAdapter::new(store, usize::from(header.reserved()));
        pager.attach(header.suite(), key)?;

        debug!(suite = %header.suite(), pages = pager.store().page_count(), "database opened");
        Ok(Self {
            pager,
            rekey: RekeyCoordinator::new(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.pager.geometry().page_size()
    }

    pub fn page_count(&self) -> PageNo {
        self.pager.store().page_count()
    }

    /// Byte range of a page that belongs to the caller: everything before
    /// the reserved trailer, minus the codec header on page 1.
    pub fn payload_range(&self, page_no: PageNo) -> Range<usize> {
        let start = if page_no == 1 { CODEC_HEADER_LEN } else { 0 };
        start..self.pager.geometry().usable()
    }

    fn check_page_no(&self, page_no: PageNo, writing: bool) -> Result<()> {
        let limit = self.page_count() + u32::from(writing);
        if page_no == 0 || page_no > limit {
            return Err(CodecError::InvalidPageNumber(page_no));
        }
        Ok(())
    }

    /// Reads a whole decrypted page.
    pub fn read_page(&mut self, page_no: PageNo) -> Result<Zeroizing<Vec<u8>>> {
        self.check_page_no(page_no, false)?;
        self.pager.read_page_vec(page_no)
    }

    /// Writes a whole page. Page `page_count() + 1` appends.
    pub fn write_page(&mut self, page_no: PageNo, page: &[u8]) -> Result<()> {
        self.check_page_no(page_no, true)?;
        self.pager.write_page(page_no, page)
    }

    /// Reads the caller's part of a page (see [`payload_range`](Self::payload_range)).
    pub fn read_payload(&mut self, page_no: PageNo) -> Result<Zeroizing<Vec<u8>>> {
        let page = self.read_page(page_no)?;
        Ok(Zeroizing::new(page[self.payload_range(page_no)].to_vec()))
    }

    /// Writes `payload` at the start of the caller's part of a page, zero
    /// padded.
    pub fn write_payload(&mut self, page_no: PageNo, payload: &[u8]) -> Result<()> {
        let range = self.payload_range(page_no);
        if payload.len() > range.len() {
            return Err(CodecError::PageSizeMismatch {
                expected: range.len(),
                actual: payload.len(),
            });
        }
        let mut page = Zeroizing::new(vec![0u8; self.page_size()]);
        page[range.start..range.start + payload.len()].copy_from_slice(payload);
        self.write_page(page_no, &page)
    }

    /// Appends a zeroed page and returns its number.
    pub fn allocate_page(&mut self) -> Result<PageNo> {
        let page_no = self.page_count() + 1;
        self.write_page(page_no, &Zeroizing::new(vec![0u8; self.page_size()]))?;
        Ok(page_no)
    }

    pub fn rekey(&mut self, target: RekeyTarget) -> Result<RekeyReport> {
        self.rekey.rekey(&mut self.pager, target)
    }

    /// Handle that cancels a rekey running on this database.
    pub fn abort_handle(&self) -> AbortHandle {
        self.rekey.abort_handle()
    }

    pub fn info(&self) -> DatabaseInfo {
        let codec = self.pager.get_codec();
        DatabaseInfo {
            suite: codec.map(|c| c.suite().id()),
            derivation: codec.map(|c| c.header().derivation()),
            geometry: self.pager.geometry(),
            page_count: self.page_count(),
        }
    }

    pub fn pager(&self) -> &PagerAdapter<S> {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut PagerAdapter<S> {
        &mut self.pager
    }

    /// Releases the codec and hands back the store.
    pub fn close(self) -> S {
        self.pager.into_store()
    }
}

impl EncryptedDatabase<FileStore> {
    pub fn create_file(path: PathBuf, config: &CodecConfig) -> Result<Self> {
        let store = FileStore::create(path, config.page_size)?;
        Self::create(store, config)
    }

    /// Opens a file, taking the page size from its header.
    pub fn open_file(path: PathBuf, secret: &Secret) -> Result<Self> {
        let header = inspect(&path)?;
        let store = FileStore::open(path, header.page_size() as usize)?;
        Self::open(store, secret)
    }
}

/// Reads the unencrypted codec header of a database file. Needs no key.
pub fn inspect(path: &Path) -> Result<CodecHeader> {
    let mut prefix = [0u8; CODEC_HEADER_LEN];
    File::open(path)?.read_exact(&mut prefix)?;
    format::parse(&prefix)
}

/// Reads the codec header from page 1 of `store`.
pub fn read_store_header<S: PageStore>(store: &S) -> Result<CodecHeader> {
    if store.page_count() == 0 {
        return Err(CodecError::InvalidHeader("store is empty".to_string()));
    }
    let mut page = Zeroizing::new(vec![0u8; store.page_size()]);
    store.read_page(1, &mut page)?;
    format::parse(&page)
}

/// Summary of an open database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// `None` once the database has been decrypted.
    pub suite: Option<SuiteId>,
    pub derivation: Option<KeyDerivation>,
    pub geometry: PageGeometry,
    pub page_count: PageNo,
}

impl fmt::Display for DatabaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.suite {
            Some(suite) => writeln!(f, "cipher:      {suite}")?,
            None => writeln!(f, "cipher:      none")?,
        }
        writeln!(f, "page size:   {}", self.geometry.page_size())?;
        writeln!(f, "reserved:    {}", self.geometry.reserved())?;
        writeln!(f, "pages:       {}", self.page_count)?;
        match self.derivation {
            Some(derivation) => write!(f, "{}", KdfLine(derivation)),
            None => write!(f, "kdf:         none"),
        }
    }
}

/// `kdf:` line shared by [`DatabaseInfo`] and [`CodecHeader`] output.
pub struct KdfLine(pub KeyDerivation);

impl fmt::Display for KdfLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            KeyDerivation::Raw => write!(f, "kdf:         raw key"),
            KeyDerivation::Argon2id(kdf) => write!(
                f,
                "kdf:         argon2id (m={} KiB, t={}, p={})",
                kdf.mem_cost_kib(),
                kdf.time_cost(),
                kdf.parallelism()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn fast() -> KdfParams {
        KdfParams::new(64, 1, 1).unwrap()
    }

    fn config(suite: SuiteId, passphrase: &str) -> CodecConfig {
        CodecConfig::new(suite)
            .with_passphrase(passphrase)
            .with_kdf(fast())
            .with_page_size(1024)
    }

    fn hello_database(suite: SuiteId) -> MemoryStore {
        let mut db =
            EncryptedDatabase::create(MemoryStore::new(1024), &config(suite, "right")).unwrap();
        assert_eq!(db.allocate_page().unwrap(), 2);
        db.write_payload(2, b"hello").unwrap();
        db.close()
    }

    #[test]
    fn reopen_with_right_key_reads_hello() {
        for suite in SuiteId::ALL {
            let store = hello_database(suite);
            let mut db = EncryptedDatabase::open(store, &Secret::passphrase("right")).unwrap();
            let payload = db.read_payload(2).unwrap();
            assert_eq!(&payload[..5], b"hello", "{suite}");
            assert!(payload[5..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn wrong_key_is_refused_on_open() {
        for suite in SuiteId::ALL {
            let store = hello_database(suite);
            assert!(
                matches!(
                    EncryptedDatabase::open(store, &Secret::passphrase("wrong")),
                    Err(CodecError::AuthenticationFailure { page: 1 })
                ),
                "{suite}"
            );
        }
    }

    #[test]
    fn tampered_key_check_is_refused_on_open() {
        let mut store = hello_database(SuiteId::Aes256Cbc);
        let mut page1 = store.raw_page(1).unwrap().to_vec();
        page1[CODEC_HEADER_LEN - 1] ^= 0x01;
        store.write_page(1, &page1).unwrap();

        assert!(matches!(
            EncryptedDatabase::open(store, &Secret::passphrase("right")),
            Err(CodecError::AuthenticationFailure { page: 1 })
        ));
    }

    #[test]
    fn wrong_key_on_plain_cbc_yields_garbage_below_the_facade() {
        let store = hello_database(SuiteId::Aes256Cbc);
        let header = read_store_header(&store).unwrap();
        let KeyDerivation::Argon2id(kdf) = header.derivation() else {
            panic!("expected a passphrase database");
        };
        let cipher = registry().get(SuiteId::Aes256Cbc);
        let key =
            crypto::derive_key(&Secret::passphrase("wrong"), header.salt(), kdf, cipher).unwrap();

        let mut pager = PagerAdapter::new(store, 0);
        pager.attach(SuiteId::Aes256Cbc, key).unwrap();
        let page = pager.read_page_vec(2).unwrap();
        assert_ne!(&page[..5], b"hello");
    }

    #[test]
    fn plaintext_never_reaches_the_store() {
        let store = hello_database(SuiteId::Aes256Gcm);
        let raw = store.to_bytes();
        assert!(!raw.windows(5).any(|w| w == b"hello"));
        assert!(format::is_encrypted(&raw));
    }

    #[test]
    fn raw_key_database_roundtrip() {
        let key = [0x5Au8; 64];
        let config = CodecConfig::new(SuiteId::Aes256CbcHmacSha256)
            .with_raw_key(&key)
            .with_page_size(512);
        let mut db = EncryptedDatabase::create(MemoryStore::new(512), &config).unwrap();
        db.allocate_page().unwrap();
        db.write_payload(2, b"raw").unwrap();
        let store = db.close();

        assert_eq!(
            read_store_header(&store).unwrap().derivation(),
            KeyDerivation::Raw
        );
        assert!(matches!(
            EncryptedDatabase::open(store.clone(), &Secret::passphrase("pw")),
            Err(CodecError::InvalidConfig(_))
        ));

        let mut db = EncryptedDatabase::open(store, &Secret::raw_key(key.to_vec())).unwrap();
        assert_eq!(&db.read_payload(2).unwrap()[..3], b"raw");
    }

    #[test]
    fn page_one_payload_survives_header_stamping() {
        let mut db = EncryptedDatabase::create(
            MemoryStore::new(1024),
            &config(SuiteId::XChaCha20Poly1305, "pw"),
        )
        .unwrap();
        db.write_payload(1, b"root page").unwrap();
        assert_eq!(&db.read_payload(1).unwrap()[..9], b"root page");
        assert_eq!(db.payload_range(1), CODEC_HEADER_LEN..1024 - 40);
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let store = hello_database(SuiteId::Aes256Gcm);
        let mut db = EncryptedDatabase::open(store, &Secret::passphrase("right")).unwrap();

        // flip a salt byte after the key has been derived
        let store = db.pager_mut().store_mut();
        let mut page1 = store.raw_page(1).unwrap().to_vec();
        page1[30] ^= 0x01;
        store.write_page(1, &page1).unwrap();

        assert!(matches!(
            db.read_page(1),
            Err(CodecError::AuthenticationFailure { page: 1 })
        ));
        assert!(db.read_page(2).is_ok());
    }

    #[test]
    fn out_of_range_pages_are_refused() {
        let mut db = EncryptedDatabase::create(
            MemoryStore::new(1024),
            &config(SuiteId::Aes256Gcm, "pw"),
        )
        .unwrap();
        assert!(matches!(db.read_page(2), Err(CodecError::InvalidPageNumber(2))));
        assert!(matches!(
            db.write_payload(3, b"x"),
            Err(CodecError::InvalidPageNumber(3))
        ));
        assert!(matches!(
            db.write_payload(2, &[1u8; 2000]),
            Err(CodecError::PageSizeMismatch { .. })
        ));
    }

    #[test]
    fn create_refuses_populated_store() {
        let store = hello_database(SuiteId::Aes256Gcm);
        assert!(matches!(
            EncryptedDatabase::create(store, &config(SuiteId::Aes256Gcm, "pw")),
            Err(CodecError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rekey_through_facade() {
        let store = hello_database(SuiteId::Aes256Gcm);
        let mut db = EncryptedDatabase::open(store, &Secret::passphrase("right")).unwrap();
        let report = db
            .rekey(RekeyTarget::Encrypted {
                suite: SuiteId::Aes256Gcm,
                secret: Secret::passphrase("next"),
                kdf: fast(),
            })
            .unwrap();
        assert_eq!(report.pages_migrated, 2);
        let store = db.close();

        let mut db = EncryptedDatabase::open(store.clone(), &Secret::passphrase("next")).unwrap();
        assert_eq!(&db.read_payload(2).unwrap()[..5], b"hello");

        assert!(matches!(
            EncryptedDatabase::open(store, &Secret::passphrase("right")),
            Err(CodecError::AuthenticationFailure { page: 1 })
        ));
    }

    #[test]
    fn file_database_roundtrip_and_inspect() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.pgc");

        let mut db = EncryptedDatabase::create_file(
            path.clone(),
            &config(SuiteId::XChaCha20Poly1305, "pw").with_page_size(2048),
        )
        .unwrap();
        db.allocate_page().unwrap();
        db.write_payload(2, b"on disk").unwrap();
        drop(db);

        let header = inspect(&path).unwrap();
        assert_eq!(header.suite(), SuiteId::XChaCha20Poly1305);
        assert_eq!(header.page_size(), 2048);

        let mut db = EncryptedDatabase::open_file(path, &Secret::passphrase("pw")).unwrap();
        assert_eq!(&db.read_payload(2).unwrap()[..7], b"on disk");

        let info = db.info();
        assert_eq!(info.page_count, 2);
        assert_eq!(info.suite, Some(SuiteId::XChaCha20Poly1305));
        assert!(info.to_string().contains("argon2id (m=64 KiB, t=1, p=1)"));
    }

    #[test]
    fn inspect_rejects_plain_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.db");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(matches!(inspect(&path), Err(CodecError::InvalidHeader(_))));
    }
}
