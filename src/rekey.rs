//! Re-encrypting an open database under a new key or cipher.
//!
//! The installed codec keeps decrypting while a shadow [`CodecContext`]
//! encrypts every page into the store's transaction. Page 1 goes last so an
//! interrupted migration never leaves a header that names the new key. The
//! new codec is installed only after the store commits; on any failure the
//! transaction is rolled back and the old codec stays in place.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::codec::{Codec, CodecContext, PageNo};
use crate::crypto::{KdfParams, Secret, SuiteId, derive_key, generate_salt, registry};
use crate::error::{CodecError, Result};
use crate::format::CODEC_HEADER_LEN;
use crate::pager::PagerAdapter;
use crate::storage::PageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RekeyState {
    Idle = 0,
    Preparing = 1,
    Migrating = 2,
    Committing = 3,
    Aborting = 4,
}

impl RekeyState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RekeyState::Preparing,
            2 => RekeyState::Migrating,
            3 => RekeyState::Committing,
            4 => RekeyState::Aborting,
            _ => RekeyState::Idle,
        }
    }
}

impl fmt::Display for RekeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RekeyState::Idle => "idle",
            RekeyState::Preparing => "preparing",
            RekeyState::Migrating => "migrating",
            RekeyState::Committing => "committing",
            RekeyState::Aborting => "aborting",
        };
        f.write_str(s)
    }
}

/// What the database should look like after the rekey.
#[derive(Debug)]
pub enum RekeyTarget {
    /// Encrypt with `suite` under a key derived from `secret` and a fresh
    /// salt.
    Encrypted {
        suite: SuiteId,
        secret: Secret,
        kdf: KdfParams,
    },
    /// Remove encryption.
    Plaintext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyReport {
    pub pages_migrated: u32,
    /// `None` when the database was decrypted.
    pub suite: Option<SuiteId>,
}

#[derive(Debug, Default)]
struct Shared {
    aborted: AtomicBool,
    state: AtomicU8,
}

/// Cancels a running rekey from another thread. Checked between pages.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<Shared>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.aborted.load(Ordering::SeqCst)
    }

    /// State of the coordinator this handle belongs to.
    pub fn state(&self) -> RekeyState {
        RekeyState::from_u8(self.0.state.load(Ordering::SeqCst))
    }
}

/// State that only exists while a rekey runs.
struct RekeySession {
    /// Write side; `None` when decrypting.
    new: Option<CodecContext>,
    migrated: u32,
    in_transaction: bool,
}

#[derive(Debug, Default)]
pub struct RekeyCoordinator {
    shared: AbortHandle,
}

impl RekeyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RekeyState {
        self.shared.state()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.shared.clone()
    }

    fn transition(&self, to: RekeyState) {
        let from = self.state();
        self.shared.0.state.store(to as u8, Ordering::SeqCst);
        info!(%from, %to, "rekey state");
    }

    /// Migrates every page of `pager` to `target`.
    ///
    /// # Errors
    ///
    /// Preparation errors ([`CodecError::DerivationFailure`],
    /// [`CodecError::KeyLengthMismatch`], [`CodecError::InvalidPageGeometry`],
    /// and [`CodecError::AuthenticationFailure`] for page 1 when the installed
    /// key does not match the stored header) are returned as is, before any
    /// page is touched. Anything that fails
    /// later is wrapped in [`CodecError::RekeyAborted`] after the store has
    /// been rolled back.
    pub fn rekey<S: PageStore>(
        &mut self,
        pager: &mut PagerAdapter<S>,
        target: RekeyTarget,
    ) -> Result<RekeyReport> {
        self.transition(RekeyState::Preparing);
        let new = match Self::prepare(pager, &target) {
            Ok(new) => new,
            Err(e) => {
                self.finish();
                return Err(e);
            }
        };
        let suite = new.as_ref().map(|ctx| ctx.suite().id());

        let mut session = RekeySession {
            new,
            migrated: 0,
            in_transaction: false,
        };

        self.transition(RekeyState::Migrating);
        if let Err((page, cause)) = self.migrate(pager, &mut session) {
            return Err(self.abort(pager, session, page, cause));
        }

        self.transition(RekeyState::Committing);
        if let Err(e) = pager.store_mut().commit() {
            return Err(self.abort(pager, session, None, e.into()));
        }

        let RekeySession { new, migrated, .. } = session;
        match new {
            Some(ctx) => {
                // built over pager.geometry() in prepare, so it always fits
                if let Some(mut old) = pager.set_codec(Box::new(ctx))? {
                    old.release();
                }
            }
            None => pager.free(),
        }

        info!(pages = migrated, suite = ?suite, "rekey committed");
        self.finish();
        Ok(RekeyReport {
            pages_migrated: migrated,
            suite,
        })
    }

    fn prepare<S: PageStore>(
        pager: &PagerAdapter<S>,
        target: &RekeyTarget,
    ) -> Result<Option<CodecContext>> {
        Self::check_installed_key(pager)?;
        match target {
            RekeyTarget::Plaintext => {
                if !pager.has_codec() {
                    return Err(CodecError::NoCodec);
                }
                Ok(None)
            }
            RekeyTarget::Encrypted { suite, secret, kdf } => {
                let suite = registry().get(*suite);
                pager.geometry().validate(suite)?;
                let salt = generate_salt()?;
                let key = derive_key(secret, &salt, *kdf, suite)?;
                CodecContext::attach(suite, key, pager.geometry()).map(Some)
            }
        }
    }

    /// Refuses to migrate when the installed codec's key is not the one
    /// recorded in the stored page-1 header. Without this an unauthenticated
    /// suite would decrypt every page to garbage and commit it.
    fn check_installed_key<S: PageStore>(pager: &PagerAdapter<S>) -> Result<()> {
        let Some(codec) = pager.get_codec() else {
            return Ok(());
        };
        if pager.store().page_count() == 0 {
            return Ok(());
        }
        let stored = crate::read_store_header(pager.store())?;
        if !stored.same_key_as(&codec.header()) {
            return Err(CodecError::AuthenticationFailure { page: 1 });
        }
        Ok(())
    }

    fn migrate<S: PageStore>(
        &self,
        pager: &mut PagerAdapter<S>,
        session: &mut RekeySession,
    ) -> std::result::Result<(), (Option<PageNo>, CodecError)> {
        let (store, mut old) = pager.parts_mut();

        store.begin().map_err(|e| (None, e.into()))?;
        session.in_transaction = true;

        let count = store.page_count();
        let mut page = Zeroizing::new(vec![0u8; store.page_size()]);

        for page_no in (2..=count).chain((count >= 1).then_some(1)) {
            if self.shared.is_aborted() {
                return Err((Some(page_no), CodecError::Cancelled));
            }
            migrate_page(
                store,
                old.as_deref_mut(),
                session.new.as_mut(),
                page_no,
                &mut page,
            )
            .map_err(|e| (Some(page_no), e))?;
            session.migrated += 1;
        }
        Ok(())
    }

    fn abort<S: PageStore>(
        &self,
        pager: &mut PagerAdapter<S>,
        session: RekeySession,
        page: Option<PageNo>,
        cause: CodecError,
    ) -> CodecError {
        self.transition(RekeyState::Aborting);
        warn!(
            page = ?page,
            migrated = session.migrated,
            error = %cause,
            "rekey aborted, rolling back"
        );

        if session.in_transaction {
            if let Err(e) = pager.store_mut().rollback() {
                warn!(error = %e, "rollback after aborted rekey failed");
            }
        }
        if let Some(mut ctx) = session.new {
            ctx.release();
        }

        self.finish();
        CodecError::RekeyAborted {
            page,
            source: Box::new(cause),
        }
    }

    fn finish(&self) {
        self.shared.0.aborted.store(false, Ordering::SeqCst);
        self.transition(RekeyState::Idle);
    }
}

fn migrate_page<S: PageStore>(
    store: &mut S,
    old: Option<&mut (dyn Codec + 'static)>,
    new: Option<&mut CodecContext>,
    page_no: PageNo,
    page: &mut [u8],
) -> Result<()> {
    store.read_page(page_no, page)?;
    if let Some(old) = old {
        old.transform_read(page_no, page)?;
    }
    match new {
        Some(ctx) => {
            let encrypted = ctx.transform_write(page_no, page)?;
            store.write_page(page_no, encrypted)?;
        }
        None => {
            // a plaintext file must not keep the codec header
            if page_no == 1 {
                page[..CODEC_HEADER_LEN].fill(0);
            }
            store.write_page(page_no, page)?;
        }
    }
    Ok(())
}
