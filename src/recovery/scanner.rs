//! recovery/scanner — сырой скан data-файла, когда реплей журнала не спас.
//!
//! Машина состояний над позицией скана (в страницах):
//! - Scanning             — обычный шаг;
//! - FollowingStreamChain — сборка chunked-вложения по цепочке ссылок;
//! - Faulted              — только что зафиксирован fault, после сдвига на
//!                          одну страницу возвращаемся в Scanning;
//! - Aborted              — фатальный исход (streak неверного ключа).
//!
//! Сканер не доверяет ничему, кроме заголовков, checksum и MAC. Для вывода
//! ключа используется позиция страницы в файле, не значение из заголовка:
//! заголовок мог быть переписан мусором, позиция — нет.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::consts::{
    ERR_MISSING_MASTER_KEY, NO_PAGE, PAGE_HDR_SIZE, RAW_ENTRY_HDR_SIZE, RAW_ENTRY_OFF_ALLOCATED,
    RAW_ENTRY_OFF_TABLE_TYPE, RAW_ENTRY_OFF_USED, RAW_SMALL_HDR_END, RAW_SMALL_OFF_NEXT_ALLOCATION,
    RAW_SMALL_OFF_NUM_ENTRIES, STREAM_DATA_START, STREAM_FLAG_FIRST, STREAM_OFF_CHUNK_SIZE,
    STREAM_OFF_FLAGS, STREAM_OFF_NEXT_PAGE, WRONG_KEY_FATAL_STREAK,
};
use crate::crypto::{derive_page_key, MasterKey};
use crate::page::{
    page_decrypt_in_place, page_header_read, page_mac_is_nonzero, page_verify_checksum,
};
use crate::util::to_hex;

use super::entities::{
    parse_attachment_tag, parse_conflict, parse_counter_group, parse_document, parse_revision,
    TableType,
};
use super::storage::RecoveryStorage;
use super::{ExecutionStatus, RecoveryOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    FollowingStreamChain,
    Faulted,
    Aborted,
}

pub struct ScanOptions {
    pub page_size: usize,
    pub master_key: Option<Arc<MasterKey>>,
    pub progress_interval: Duration,
    /// Каталог для временных файлов сборки вложений.
    pub scratch_dir: PathBuf,
}

pub struct Scanner<'a> {
    data: &'a [u8],
    opts: ScanOptions,
    total_pages: u64,
    wrong_key_streak: u32,
    last_recovered_id: Option<String>,
    state: ScanState,
}

enum Step {
    /// Сдвиг на столько страниц вперёд.
    Advance(u64),
    /// Страница-fault: учтена, сдвиг на одну.
    Fault,
}

impl<'a> Scanner<'a> {
    pub fn new(data: &'a [u8], opts: ScanOptions) -> Self {
        let total_pages = (data.len() / opts.page_size) as u64;
        Self {
            data,
            opts,
            total_pages,
            wrong_key_streak: 0,
            last_recovered_id: None,
            state: ScanState::Scanning,
        }
    }

    /// Полный проход файла. Fault'ы и мусорные записи — не ошибки; Err
    /// возвращается только для фатальных исходов (streak неверного ключа).
    pub fn scan(
        &mut self,
        sink: &mut dyn RecoveryStorage,
        status: &mut ExecutionStatus,
        cancel: &AtomicBool,
    ) -> Result<RecoveryOutcome> {
        let mut pos: u64 = 0;
        let mut last_progress = Instant::now();

        info!(
            "scanner: {} page(s) of {} bytes each{}",
            self.total_pages,
            self.opts.page_size,
            if self.opts.master_key.is_some() {
                " (encrypted)"
            } else {
                ""
            }
        );

        while pos < self.total_pages {
            if cancel.load(Ordering::Relaxed) {
                info!("scanner: cancellation requested at page {}", pos);
                return Ok(RecoveryOutcome::CancellationRequested);
            }
            if last_progress.elapsed() >= self.opts.progress_interval {
                let pct = pos * 100 / self.total_pages.max(1);
                info!(
                    "scanner: page {}/{} ({}%), state {:?}, last recovered: {}",
                    pos,
                    self.total_pages,
                    pct,
                    self.state,
                    self.last_recovered_id.as_deref().unwrap_or("-")
                );
                last_progress = Instant::now();
            }

            let step = self.step(pos, sink, status)?;
            match step {
                Step::Advance(n) => {
                    self.state = ScanState::Scanning;
                    status.pages_scanned += n;
                    pos += n;
                }
                Step::Fault => {
                    self.state = ScanState::Faulted;
                    status.pages_scanned += 1;
                    status.faulted_pages += 1;
                    pos += 1;
                }
            }
        }

        info!(
            "scanner: done, {} page(s) scanned, {} fault(s)",
            status.pages_scanned, status.faulted_pages
        );
        Ok(RecoveryOutcome::Success)
    }

    #[inline]
    fn page_raw(&self, page: u64, pages: u64) -> &'a [u8] {
        let ps = self.opts.page_size;
        &self.data[(page as usize) * ps..((page + pages) as usize) * ps]
    }

    /// Проверить/расшифровать span, начинающийся на `page`.
    /// Ok(None) — страница не прошла проверку (fault уже классифицирован).
    fn verified_span(&mut self, page: u64, pages: u64) -> Result<Option<Vec<u8>>> {
        let raw = self.page_raw(page, pages);
        let mut plain = raw.to_vec();

        let verified = match &self.opts.master_key {
            Some(mk) => {
                let key = derive_page_key(mk, page);
                page_decrypt_in_place(&mut plain, &key).is_ok()
            }
            None => page_verify_checksum(&plain).unwrap_or(false),
        };

        if !verified {
            // Ненулевой MAC при несошедшейся проверке — признак шифртекста:
            // либо стор шифрован, а ключа нет, либо ключ неверен.
            if page_mac_is_nonzero(raw) {
                self.wrong_key_streak += 1;
                if self.wrong_key_streak > WRONG_KEY_FATAL_STREAK {
                    self.state = ScanState::Aborted;
                    return Err(anyhow!(
                        "{}: {} consecutive unverifiable pages with non-zero MAC",
                        ERR_MISSING_MASTER_KEY,
                        self.wrong_key_streak
                    ));
                }
            } else {
                self.wrong_key_streak = 0;
            }
            return Ok(None);
        }

        self.wrong_key_streak = 0;
        Ok(Some(plain))
    }

    fn step(
        &mut self,
        pos: u64,
        sink: &mut dyn RecoveryStorage,
        status: &mut ExecutionStatus,
    ) -> Result<Step> {
        let ps = self.opts.page_size;
        let head_raw = self.page_raw(pos, 1);

        // Неинициализированная страница: нулевой заголовок, проверять нечего
        if head_raw[..PAGE_HDR_SIZE].iter().all(|&b| b == 0) {
            status.skipped_pages += 1;
            return Ok(Step::Advance(1));
        }

        let hdr = page_header_read(head_raw)?;
        let mut pages = hdr.number_of_pages(ps) as u64;

        if hdr.is_overflow() {
            // Заголовку пока нельзя верить: границы сначала
            if hdr.overflow_size == 0 || pos + pages > self.total_pages {
                debug!(
                    "scanner: page {}: overflow bounds invalid (size={}, span={})",
                    pos, hdr.overflow_size, pages
                );
                return Ok(Step::Fault);
            }
        } else {
            pages = 1;
        }

        let plain = match self.verified_span(pos, pages)? {
            Some(p) => p,
            None => {
                debug!("scanner: page {}: verification failed", pos);
                return Ok(Step::Fault);
            }
        };

        // Проверенная страница обязана лежать на своём месте
        if hdr.page_number != pos {
            debug!(
                "scanner: page {}: header claims page_number {}",
                pos, hdr.page_number
            );
            return Ok(Step::Fault);
        }

        if hdr.is_stream() {
            let stream_flags =
                LittleEndian::read_u32(&plain[STREAM_OFF_FLAGS..STREAM_OFF_FLAGS + 4]);
            if stream_flags & STREAM_FLAG_FIRST == 0 {
                // Хвост чужой цепочки — ожидаемая структура, не порча
                status.skipped_pages += pages;
                return Ok(Step::Advance(pages));
            }
            self.state = ScanState::FollowingStreamChain;
            return match self.follow_stream_chain(pos, plain, sink, status) {
                Ok(()) => Ok(Step::Advance(pages)),
                Err(e) => {
                    warn!("scanner: stream chain at page {} broken: {:#}", pos, e);
                    Ok(Step::Fault)
                }
            };
        }

        if hdr.is_raw_data() {
            if hdr.is_overflow() {
                self.raw_overflow_entry(pos, &plain, sink, status);
            } else {
                self.raw_small_entries(pos, &plain, sink, status);
            }
            return Ok(Step::Advance(pages));
        }

        // Не raw-data и не stream: контент B-Tree и прочих секций, не наш
        status.skipped_pages += pages;
        Ok(Step::Advance(pages))
    }

    // ---------- stream-цепочки ----------

    /// Собрать вложение по цепочке ссылок next_page, инкрементально хешируя
    /// chunk'и. Терминальный chunk (chunk_size == 0) несёт опциональный тег.
    fn follow_stream_chain(
        &mut self,
        head: u64,
        head_plain: Vec<u8>,
        sink: &mut dyn RecoveryStorage,
        status: &mut ExecutionStatus,
    ) -> Result<()> {
        let ps = self.opts.page_size;
        let tmp_path = self.opts.scratch_dir.join(format!("stream-{}.tmp", head));
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("create scratch file {}", tmp_path.display()))?;

        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut visited: u64 = 0;
        let mut plain = head_plain;

        loop {
            visited += 1;
            if visited > self.total_pages {
                fs::remove_file(&tmp_path).ok();
                return Err(anyhow!("stream chain does not terminate (cycle?)"));
            }

            let chunk_size =
                LittleEndian::read_u64(&plain[STREAM_OFF_CHUNK_SIZE..STREAM_OFF_CHUNK_SIZE + 8]);

            if chunk_size == 0 {
                // Терминальный chunk: опциональный тег и конец цепочки
                let tag = parse_attachment_tag(&plain[STREAM_DATA_START..])
                    .unwrap_or_default();
                tmp.sync_all()?;
                let hash = to_hex(&hasher.finalize());
                if sink.attachment_exists(&hash) {
                    debug!("scanner: attachment {} deduplicated", hash);
                }
                sink.put_attachment(&tmp_path, &hash, total, tag)?;
                status.attachments += 1;
                fs::remove_file(&tmp_path).ok();
                return Ok(());
            }

            let avail = plain.len() - STREAM_DATA_START;
            if chunk_size as usize > avail {
                fs::remove_file(&tmp_path).ok();
                return Err(anyhow!(
                    "stream chunk of {} bytes exceeds page span ({} available)",
                    chunk_size,
                    avail
                ));
            }
            let chunk = &plain[STREAM_DATA_START..STREAM_DATA_START + chunk_size as usize];
            hasher.update(chunk);
            tmp.write_all(chunk)?;
            total += chunk_size;

            let next =
                LittleEndian::read_u64(&plain[STREAM_OFF_NEXT_PAGE..STREAM_OFF_NEXT_PAGE + 8]);
            if next == NO_PAGE || next >= self.total_pages {
                fs::remove_file(&tmp_path).ok();
                return Err(anyhow!("stream chain truncated (next={})", next));
            }

            // Следующее звено: сначала его собственный span
            let next_hdr = page_header_read(self.page_raw(next, 1))?;
            let next_pages = next_hdr.number_of_pages(ps) as u64;
            if next + next_pages > self.total_pages {
                fs::remove_file(&tmp_path).ok();
                return Err(anyhow!("stream chain link at {} out of bounds", next));
            }
            plain = match self.verified_span(next, next_pages)? {
                Some(p) => p,
                None => {
                    fs::remove_file(&tmp_path).ok();
                    return Err(anyhow!("stream chain link at {} failed verification", next));
                }
            };
        }
    }

    // ---------- raw-data entries ----------

    fn dispatch_entry(
        &mut self,
        page: u64,
        table_type: u8,
        payload: &[u8],
        sink: &mut dyn RecoveryStorage,
        status: &mut ExecutionStatus,
    ) {
        let parsed: Result<bool> = (|| {
            match TableType::from_u8(table_type) {
                Some(TableType::Documents) => {
                    if let Some(doc) = parse_document(payload)? {
                        self.last_recovered_id = Some(doc.id.clone());
                        sink.put_document(doc)?;
                        status.documents += 1;
                        return Ok(true);
                    }
                }
                Some(TableType::Revisions) => {
                    if let Some(rev) = parse_revision(payload)? {
                        sink.put_revision(rev)?;
                        status.revisions += 1;
                        return Ok(true);
                    }
                }
                Some(TableType::Conflicts) => {
                    if let Some(c) = parse_conflict(payload)? {
                        sink.put_conflict(c)?;
                        status.conflicts += 1;
                        return Ok(true);
                    }
                }
                Some(TableType::Counters) => {
                    if let Some(g) = parse_counter_group(payload)? {
                        sink.put_counter_group(g)?;
                        status.counter_groups += 1;
                        return Ok(true);
                    }
                }
                None => {}
            }
            Ok(false)
        })();

        match parsed {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "scanner: page {}: entry (table_type={}) not parseable, skipped",
                    page, table_type
                );
                status.malformed_entries += 1;
            }
            Err(e) => {
                debug!("scanner: page {}: malformed entry: {:#}", page, e);
                status.malformed_entries += 1;
            }
        }
    }

    /// Маленькая raw-data страница: записи от RAW_SMALL_HDR_END в пределах
    /// next_allocation. Запись с границами за пределами страницы обрывает
    /// итерацию этой страницы, не весь скан.
    fn raw_small_entries(
        &mut self,
        page: u64,
        plain: &[u8],
        sink: &mut dyn RecoveryStorage,
        status: &mut ExecutionStatus,
    ) {
        let ps = self.opts.page_size;
        let next_alloc = LittleEndian::read_u16(
            &plain[RAW_SMALL_OFF_NEXT_ALLOCATION..RAW_SMALL_OFF_NEXT_ALLOCATION + 2],
        ) as usize;
        let num_entries = LittleEndian::read_u16(
            &plain[RAW_SMALL_OFF_NUM_ENTRIES..RAW_SMALL_OFF_NUM_ENTRIES + 2],
        ) as usize;
        let bound = next_alloc.min(ps);

        let mut off = RAW_SMALL_HDR_END;
        let mut seen = 0usize;
        while seen < num_entries && off + RAW_ENTRY_HDR_SIZE <= bound {
            let allocated = LittleEndian::read_u16(
                &plain[off + RAW_ENTRY_OFF_ALLOCATED..off + RAW_ENTRY_OFF_ALLOCATED + 2],
            ) as usize;
            let used = LittleEndian::read_u16(
                &plain[off + RAW_ENTRY_OFF_USED..off + RAW_ENTRY_OFF_USED + 2],
            ) as usize;
            let table_type = plain[off + RAW_ENTRY_OFF_TABLE_TYPE];

            if used > allocated || off + RAW_ENTRY_HDR_SIZE + allocated > ps {
                debug!(
                    "scanner: page {}: entry at {} out of bounds (allocated={}, used={}), \
                     page iteration stopped",
                    page, off, allocated, used
                );
                status.malformed_entries += 1;
                return;
            }

            if used > 0 {
                let payload = &plain[off + RAW_ENTRY_HDR_SIZE..off + RAW_ENTRY_HDR_SIZE + used];
                self.dispatch_entry(page, table_type, payload, sink, status);
            }
            off += RAW_ENTRY_HDR_SIZE + allocated;
            seen += 1;
        }
    }

    /// Raw-data overflow: одна запись сразу после заголовка страницы.
    fn raw_overflow_entry(
        &mut self,
        page: u64,
        plain: &[u8],
        sink: &mut dyn RecoveryStorage,
        status: &mut ExecutionStatus,
    ) {
        let used = LittleEndian::read_u16(
            &plain[PAGE_HDR_SIZE + RAW_ENTRY_OFF_USED..PAGE_HDR_SIZE + RAW_ENTRY_OFF_USED + 2],
        ) as usize;
        let table_type = plain[PAGE_HDR_SIZE + RAW_ENTRY_OFF_TABLE_TYPE];
        let start = PAGE_HDR_SIZE + RAW_ENTRY_HDR_SIZE;
        if start + used > plain.len() {
            debug!(
                "scanner: page {}: overflow entry of {} bytes exceeds span",
                page, used
            );
            status.malformed_entries += 1;
            return;
        }
        self.dispatch_entry(page, table_type, &plain[start..start + used], sink, status);
    }
}
