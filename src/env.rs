//! env — точка входа стора: открытие/создание, журнал, выдача транзакций.
//!
//! Жизненный цикл:
//! - create: meta + пустой data-файл + журнал с заголовком;
//! - open: реплей журнала (clean shutdown -> только усечение), затем
//!   clean_shutdown = false до закрытия;
//! - commit: батч в журнал (один fsync), затем образы в data-файл, затем
//!   усечение журнала по порогу;
//! - close/Drop: meta с актуальными next_page_id/last_lsn и clean_shutdown = true.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::VellumConfig;
use crate::consts::{DEFAULT_PAGE_SIZE, META_FLAG_ENCRYPTED};
use crate::crypto::MasterKey;
use crate::journal::{journal_replay, Journal, ReplayOptions};
use crate::meta::{read_meta, write_meta_new, write_meta_overwrite, MetaHeader};
use crate::pager::{
    EncryptedPager, EncryptionBufferPool, PageImage, Pager, TransactionContextPool,
};
use crate::txn::Transaction;

#[derive(Clone)]
pub struct EnvOptions {
    pub page_size: u32,
    pub master_key: Option<Arc<MasterKey>>,
    /// fsync data-файла при каждой записи страниц (false — только на коммите).
    pub data_fsync: bool,
    pub ignore_invalid_journal: bool,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            master_key: None,
            data_fsync: false,
            ignore_invalid_journal: false,
        }
    }
}

impl EnvOptions {
    /// Опции стора из центрального конфига (VL_* переменные + builder).
    pub fn from_config(cfg: &VellumConfig, master_key: Option<Arc<MasterKey>>) -> Self {
        Self {
            page_size: cfg.page_size,
            master_key,
            data_fsync: cfg.data_fsync,
            ignore_invalid_journal: cfg.ignore_invalid_journal,
        }
    }
}

pub struct Env {
    root: PathBuf,
    pager: Mutex<Pager>,
    crypto: EncryptedPager,
    journal: Mutex<Journal>,
    buffer_pool: Arc<EncryptionBufferPool>,
    locator_pool: Arc<TransactionContextPool>,
    next_tx_id: AtomicU64,
    next_lsn: AtomicU64,
    closed: Mutex<bool>,
}

impl Env {
    /// Создать новый стор в пустом каталоге.
    pub fn create(root: &Path, opts: &EnvOptions) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create store root {}", root.display()))?;
        let flags = if opts.master_key.is_some() {
            META_FLAG_ENCRYPTED
        } else {
            0
        };
        write_meta_new(
            root,
            &MetaHeader {
                page_size: opts.page_size,
                flags,
                ..MetaHeader::default()
            },
        )?;
        Pager::create_data_file(root)?;
        info!(
            "created store at {} (page_size={}, encrypted={})",
            root.display(),
            opts.page_size,
            opts.master_key.is_some()
        );
        Self::open(root, opts)
    }

    /// Открыть существующий стор; при нечистом завершении — реплей журнала.
    pub fn open(root: &Path, opts: &EnvOptions) -> Result<Self> {
        let meta = read_meta(root)?;
        if meta.encrypted() && opts.master_key.is_none() {
            return Err(anyhow!(
                "store at {} is encrypted but no master key was provided",
                root.display()
            ));
        }
        if !meta.encrypted() && opts.master_key.is_some() {
            return Err(anyhow!(
                "store at {} is not encrypted but a master key was provided",
                root.display()
            ));
        }

        let mut pager = Pager::open(root)?;
        pager.set_data_fsync(opts.data_fsync);

        // Реплей сам решает по clean_shutdown, применять ли что-то
        let report = journal_replay(
            &mut pager,
            ReplayOptions {
                ignore_invalid: opts.ignore_invalid_journal,
                truncate_after: true,
            },
        )?;
        if report.max_lsn > pager.meta.last_lsn {
            pager.meta.last_lsn = report.max_lsn;
        }
        if !meta.clean_shutdown {
            info!(
                "unclean shutdown at {}: journal replay applied {} page image(s)",
                root.display(),
                report.applied
            );
        }

        // До закрытия стор считается нечистым
        let mut dirty = pager.meta.clone();
        dirty.clean_shutdown = false;
        write_meta_overwrite(root, &dirty)?;

        let journal = Journal::open_for_append(root)?;
        let last_lsn = pager.meta.last_lsn;
        let crypto = EncryptedPager::new(opts.master_key.clone());
        Ok(Self {
            root: root.to_path_buf(),
            pager: Mutex::new(pager),
            crypto,
            journal: Mutex::new(journal),
            buffer_pool: Arc::new(EncryptionBufferPool::new()),
            locator_pool: Arc::new(TransactionContextPool::new()),
            next_tx_id: AtomicU64::new(1),
            next_lsn: AtomicU64::new(last_lsn + 1),
            closed: Mutex::new(false),
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_size(&self) -> usize {
        self.pager.lock().unwrap().page_size()
    }

    pub fn encrypted(&self) -> bool {
        self.crypto.encrypted()
    }

    pub(crate) fn pager(&self) -> &Mutex<Pager> {
        &self.pager
    }

    pub(crate) fn crypto(&self) -> &EncryptedPager {
        &self.crypto
    }

    pub(crate) fn buffer_pool(&self) -> Arc<EncryptionBufferPool> {
        Arc::clone(&self.buffer_pool)
    }

    pub(crate) fn locator_pool(&self) -> &TransactionContextPool {
        &self.locator_pool
    }

    /// Начать пишущую транзакцию.
    pub fn write_txn(&self, long_lived: bool) -> Transaction<'_> {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        Transaction::new(self, id, long_lived)
    }

    /// Применить write-set: журнал (fsync) -> data-файл -> fsync -> усечение.
    pub(crate) fn commit_images(&self, tx_id: u64, images: &[PageImage]) -> Result<()> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::Relaxed);
        {
            let mut journal = self.journal.lock().unwrap();
            journal.append_batch(lsn, images)?;
        }
        {
            let mut pager = self.pager.lock().unwrap();
            for img in images {
                pager.write_span_raw(img.page_number, &img.bytes)?;
            }
            pager.sync()?;
            if lsn > pager.meta.last_lsn {
                pager.meta.last_lsn = lsn;
            }
        }
        {
            let mut journal = self.journal.lock().unwrap();
            journal.maybe_truncate()?;
        }
        debug!(
            "tx {}: committed lsn={} ({} page image(s))",
            tx_id,
            lsn,
            images.len()
        );
        Ok(())
    }

    /// Явное закрытие: финальный meta с clean_shutdown = true.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return Ok(());
        }
        let pager = self.pager.lock().unwrap();
        pager.sync()?;
        let mut m = pager.meta.clone();
        m.clean_shutdown = true;
        write_meta_overwrite(&self.root, &m)?;
        *closed = true;
        debug!("store at {} closed cleanly", self.root.display());
        Ok(())
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        // best-effort: упасть в Drop нельзя
        let _ = self.close();
    }
}
