//! recovery — офлайновое восстановление стора из сырых байт.
//!
//! Порядок:
//! 1. попытка реплея журнала (journal.rs): обычно в copy-on-write
//!    отображение, оригинальный файл не мутируется;
//! 2. сырой скан (scanner.rs) поверх отображения или файла как есть;
//! 3. приёмник (storage.rs) собирает свежий выходной стор;
//! 4. summary.json с итоговыми счётчиками и исходом.
//!
//! Любая ошибка реплея (кроме различимого сигнала «нужен запуск без CoW»)
//! не фатальна: управление всегда доходит до сканера.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use memmap2::Mmap;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::consts::{DATA_FILE, DEFAULT_PAGE_SIZE, ERR_MISSING_MASTER_KEY};
use crate::crypto::MasterKey;
use crate::meta::{read_meta, validate_page_size};

pub mod entities;
pub mod journal;
pub mod scanner;
pub mod storage;

pub use entities::{AttachmentTag, RecoveredCounterGroup, RecoveredDocument, TableType};
pub use journal::{probe_journal, ProbeResult};
pub use scanner::{ScanOptions, Scanner};
pub use storage::{OrphanPolicy, RecoverySink, RecoveryStorage};

/// Конфигурация одного прогона восстановления.
#[derive(Clone)]
pub struct RecoveryConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Используется, когда meta нечитаем; иначе размер берётся из meta.
    pub page_size: Option<u32>,
    pub master_key: Option<Arc<MasterKey>>,
    pub progress_interval: Duration,
    pub ignore_invalid_journal: bool,
    pub copy_on_write: bool,
    pub discard_orphans: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Success,
    CancellationRequested,
}

impl RecoveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::CancellationRequested => "cancelled",
        }
    }
}

/// Счётчики прогона; уходят в summary.json.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ExecutionStatus {
    pub pages_scanned: u64,
    pub skipped_pages: u64,
    pub faulted_pages: u64,
    pub malformed_entries: u64,
    pub documents: u64,
    pub revisions: u64,
    pub conflicts: u64,
    pub counter_groups: u64,
    pub attachments: u64,
    pub duplicates_discarded: u64,
    pub orphans_preserved: u64,
    pub orphans_discarded: u64,
}

pub struct Recovery {
    cfg: RecoveryConfig,
}

impl Recovery {
    pub fn new(cfg: RecoveryConfig) -> Result<Self> {
        if !cfg.data_dir.is_dir() {
            return Err(anyhow!(
                "data dir {} does not exist",
                cfg.data_dir.display()
            ));
        }
        if let Some(ps) = cfg.page_size {
            validate_page_size(ps)?;
        }
        Ok(Self { cfg })
    }

    /// Полный прогон. Err — только фатальные исходы (нет ключа для
    /// шифрованного стора, streak неверного ключа, сигнал disable-CoW).
    pub fn run(&self, cancel: &AtomicBool) -> Result<(RecoveryOutcome, ExecutionStatus)> {
        let root = &self.cfg.data_dir;

        // 1) page_size и признак шифрования — из meta, если он жив
        let (page_size, meta_ok) = match read_meta(root) {
            Ok(m) => {
                if m.encrypted() && self.cfg.master_key.is_none() {
                    return Err(anyhow!(
                        "{}: store at {} is flagged encrypted",
                        ERR_MISSING_MASTER_KEY,
                        root.display()
                    ));
                }
                (m.page_size, true)
            }
            Err(e) => {
                warn!("recovery: meta unreadable ({:#}), scanning blind", e);
                (self.cfg.page_size.unwrap_or(DEFAULT_PAGE_SIZE), false)
            }
        };

        // 2) реплей журнала; без meta pager не открыть — сразу сырой скан
        let probe = if meta_ok {
            probe_journal(
                root,
                self.cfg.ignore_invalid_journal,
                self.cfg.copy_on_write,
            )?
        } else {
            ProbeResult::UseFile
        };

        // 3) источник байт для сканера
        let data_path = root.join(DATA_FILE);
        let file_mmap;
        let cow_mmap;
        let data: &[u8] = match probe {
            ProbeResult::Mapped(m) => {
                cow_mmap = m;
                &cow_mmap[..]
            }
            ProbeResult::UseFile => {
                let f = OpenOptions::new()
                    .read(true)
                    .open(&data_path)
                    .with_context(|| format!("open data file {}", data_path.display()))?;
                if f.metadata()?.len() == 0 {
                    info!("recovery: data file is empty, nothing to scan");
                    &[]
                } else {
                    // SAFETY: файл открыт на чтение; скан толерантен к
                    // содержимому, меняющемуся под ногами, — это офлайн-тул.
                    file_mmap = unsafe { Mmap::map(&f) }
                        .with_context(|| format!("mmap {}", data_path.display()))?;
                    &file_mmap[..]
                }
            }
        };

        // 4) приёмник и scratch-каталог
        let policy = if self.cfg.discard_orphans {
            OrphanPolicy::Discard
        } else {
            OrphanPolicy::Preserve
        };
        let mut sink = RecoverySink::create(&self.cfg.output_dir, policy)?;
        let scratch_dir = self.cfg.output_dir.join(".scratch");
        fs::create_dir_all(&scratch_dir)?;

        // 5) скан
        let mut status = ExecutionStatus::default();
        let mut scanner = Scanner::new(
            data,
            ScanOptions {
                page_size: page_size as usize,
                master_key: self.cfg.master_key.clone(),
                progress_interval: self.cfg.progress_interval,
                scratch_dir: scratch_dir.clone(),
            },
        );
        let outcome = scanner.scan(&mut sink, &mut status, cancel)?;

        // 6) сироты, финализация, отчёт
        sink.handle_orphans()?;
        sink.finalize()?;
        status.duplicates_discarded = sink.duplicates_discarded;
        status.orphans_preserved = sink.orphans_preserved;
        status.orphans_discarded = sink.orphans_discarded;
        fs::remove_dir_all(&scratch_dir).ok();

        self.write_summary(outcome, &status)?;
        info!(
            "recovery: {} ({} document(s), {} fault(s))",
            outcome.as_str(),
            status.documents,
            status.faulted_pages
        );
        Ok((outcome, status))
    }

    fn write_summary(&self, outcome: RecoveryOutcome, status: &ExecutionStatus) -> Result<()> {
        let path = self.cfg.output_dir.join("summary.json");
        let summary = serde_json::json!({
            "outcome": outcome.as_str(),
            "data_dir": self.cfg.data_dir.display().to_string(),
            "encrypted": self.cfg.master_key.is_some(),
            "status": status,
        });
        fs::write(&path, serde_json::to_vec_pretty(&summary)?)
            .with_context(|| format!("write {}", path.display()))?;
        File::open(&path)?.sync_all()?;
        Ok(())
    }
}
