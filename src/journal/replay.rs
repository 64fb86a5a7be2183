//! journal/replay — применение журнала к data-файлу.
//!
//! Правила:
//! - применяются только образы страниц внутри закоммиченных батчей
//!   (BEGIN..COMMIT с совпадающим lsn);
//! - частичный хвост (оборванный заголовок, недописанный payload, битый CRC
//!   последнего кадра) — нормальный конец файла, не ошибка;
//! - неизвестные типы кадров пропускаются (forward-совместимость);
//! - в CoW-режиме pager'а записи остаются в приватном отображении, а файл
//!   журнала не усекается (truncate_after = false).

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};

use crate::consts::{
    WAL_HDR_SIZE, WAL_MAGIC, WAL_REC_BEGIN, WAL_REC_COMMIT, WAL_REC_HDR_SIZE, WAL_REC_OFF_CRC32,
    WAL_REC_OFF_LEN, WAL_REC_OFF_LSN, WAL_REC_OFF_PAGE_ID, WAL_REC_PAGE_IMAGE,
};
use crate::pager::Pager;

use super::{crc32_of_parts, journal_path, write_journal_file_header};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Глотать структурные ошибки журнала (плохая магия и т.п.) вместо
    /// фатальной ошибки. Частичные хвосты терпимы всегда.
    pub ignore_invalid: bool,
    /// Усечь журнал до заголовка после успешного прохода.
    pub truncate_after: bool,
}

#[derive(Debug, Default)]
pub struct ReplayReport {
    pub applied: usize,
    pub max_lsn: u64,
}

/// Проиграть журнал в pager. Отсутствующий журнал — не ошибка.
pub fn journal_replay(pager: &mut Pager, opts: ReplayOptions) -> Result<ReplayReport> {
    let path = journal_path(&pager.root);
    let mut report = ReplayReport::default();
    if !path.exists() {
        debug!("journal replay: no journal at {}", path.display());
        return Ok(report);
    }

    let mut f = OpenOptions::new()
        .read(true)
        .write(opts.truncate_after)
        .open(&path)
        .with_context(|| format!("open journal {}", path.display()))?;

    let len = f.metadata()?.len();
    if len < WAL_HDR_SIZE as u64 {
        debug!("journal replay: journal shorter than header, nothing to do");
        if opts.truncate_after {
            write_journal_file_header(&mut f)?;
            f.sync_all()?;
        }
        return Ok(report);
    }

    let mut magic = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut magic)?;
    if &magic != WAL_MAGIC {
        if opts.ignore_invalid {
            warn!("journal replay: bad magic in {}, skipping", path.display());
            return Ok(report);
        }
        return Err(anyhow!("bad journal magic in {}", path.display()));
    }

    // Чистое завершение: всё из журнала уже в data-файле, реплей не нужен.
    if pager.meta.clean_shutdown {
        debug!("journal replay: clean shutdown, skip replay");
        if opts.truncate_after && len > WAL_HDR_SIZE as u64 {
            f.set_len(WAL_HDR_SIZE as u64)?;
            f.sync_all()?;
        }
        return Ok(report);
    }

    let mut pos = WAL_HDR_SIZE as u64;
    // Образы текущего батча; применяются только по COMMIT
    let mut batch: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut batch_lsn: Option<u64> = None;

    while pos + (WAL_REC_HDR_SIZE as u64) <= len {
        f.seek(SeekFrom::Start(pos))?;
        let mut hdr = [0u8; WAL_REC_HDR_SIZE];
        if f.read_exact(&mut hdr).is_err() {
            debug!("journal replay: partial header tail at off={}, stop", pos);
            break;
        }

        let rec_type = hdr[0];
        let payload_len =
            LittleEndian::read_u32(&hdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4]) as usize;
        let crc_expected =
            LittleEndian::read_u32(&hdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4]);
        let rec_total = WAL_REC_HDR_SIZE as u64 + payload_len as u64;

        if pos + rec_total > len {
            debug!(
                "journal replay: partial record tail at off={} (need {} bytes), stop",
                pos, rec_total
            );
            break;
        }

        let mut payload = vec![0u8; payload_len];
        f.read_exact(&mut payload)?;

        let crc_actual = crc32_of_parts(&hdr[..WAL_REC_OFF_CRC32], &payload);
        if crc_actual != crc_expected {
            warn!(
                "journal replay: CRC mismatch at off={} (expected {}, actual {}), stop",
                pos, crc_expected, crc_actual
            );
            break;
        }

        let lsn = LittleEndian::read_u64(&hdr[WAL_REC_OFF_LSN..WAL_REC_OFF_LSN + 8]);
        if lsn > report.max_lsn {
            report.max_lsn = lsn;
        }

        match rec_type {
            WAL_REC_BEGIN => {
                if batch_lsn.is_some() {
                    // Предыдущий батч остался без COMMIT — отбрасываем
                    debug!("journal replay: batch lsn={:?} had no commit, dropped", batch_lsn);
                }
                batch.clear();
                batch_lsn = Some(lsn);
            }
            WAL_REC_PAGE_IMAGE => {
                if batch_lsn == Some(lsn) {
                    let page_id =
                        LittleEndian::read_u64(&hdr[WAL_REC_OFF_PAGE_ID..WAL_REC_OFF_PAGE_ID + 8]);
                    batch.push((page_id, payload));
                } else {
                    debug!(
                        "journal replay: page image outside batch at off={}, skipped",
                        pos
                    );
                }
            }
            WAL_REC_COMMIT => {
                if batch_lsn == Some(lsn) {
                    for (page_id, bytes) in batch.drain(..) {
                        pager.write_span_raw(page_id, &bytes)?;
                        report.applied += 1;
                    }
                }
                batch_lsn = None;
            }
            _ => {
                debug!("journal replay: unknown record type {}, skipped", rec_type);
            }
        }

        pos += rec_total;
    }

    if report.applied > 0 {
        info!(
            "journal replay: applied {} page image(s), max_lsn={}",
            report.applied, report.max_lsn
        );
        pager.sync()?;
    } else {
        debug!("journal replay: nothing to apply");
    }

    if opts.truncate_after {
        f.set_len(WAL_HDR_SIZE as u64)?;
        f.sync_all()?;
        debug!("journal replay: truncated to header");
    }
    Ok(report)
}
