//! recovery/journal — попытка реплея журнала раньше сырого скана.
//!
//! Политика (ветвление по стабильным фразам ошибок, см. consts.rs):
//! - обычный путь: copy-on-write отображение data-файла, реплей в него —
//!   оригинальный файл не мутируется, сканер получает отображение с
//!   применёнными образами;
//! - "data file must grow": журнал содержит образы за пределами файла —
//!   файл расширяется до требуемой длины и попытка повторяется один раз
//!   со свежим pager'ом;
//! - "copy-on-write mapping allocation failed": различимая ошибка — нужен
//!   явный запуск с --disable-copy-on-write (согласие оператора на записи
//!   в оригинал), наружу уходит как есть;
//! - любая другая ошибка реплея логируется и глотается: управление всегда
//!   доходит до сканера.

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::consts::{
    DATA_FILE, ERR_DATA_FILE_MUST_GROW, ERR_MAPPING_OOM, WAL_HDR_SIZE, WAL_REC_HDR_SIZE,
    WAL_REC_OFF_CRC32, WAL_REC_OFF_LEN, WAL_REC_OFF_PAGE_ID, WAL_REC_PAGE_IMAGE,
};
use crate::journal::{crc32_of_parts, journal_path, journal_replay, ReplayOptions};
use crate::pager::Pager;

/// Чем сканеру читать данные после попытки реплея.
pub enum ProbeResult {
    /// CoW-отображение с применённым журналом (оригинал не тронут).
    Mapped(MmapMut),
    /// Реплей не удался или не нужен: сканировать файл как есть.
    UseFile,
}

pub fn probe_journal(root: &Path, ignore_invalid: bool, copy_on_write: bool) -> Result<ProbeResult> {
    if !copy_on_write {
        // Согласие оператора: реплей пишет в оригинальный data-файл
        match replay_direct(root, ignore_invalid) {
            Ok(applied) => info!("journal probe: direct replay applied {} image(s)", applied),
            Err(e) => warn!("journal probe: direct replay failed, proceeding to scan: {:#}", e),
        }
        return Ok(ProbeResult::UseFile);
    }

    match replay_cow(root, ignore_invalid) {
        Ok(mmap) => Ok(ProbeResult::Mapped(mmap)),
        Err(e) => {
            let msg = format!("{:#}", e);
            if msg.contains(ERR_MAPPING_OOM) {
                // Различимый сигнал: без согласия оператора дальше нельзя
                return Err(e);
            }
            if msg.contains(ERR_DATA_FILE_MUST_GROW) {
                info!("journal probe: {}, extending data file and retrying once", ERR_DATA_FILE_MUST_GROW);
                if let Err(grow_err) = grow_data_file(root) {
                    warn!("journal probe: grow failed: {:#}", grow_err);
                    return Ok(ProbeResult::UseFile);
                }
                match replay_cow(root, ignore_invalid) {
                    Ok(mmap) => return Ok(ProbeResult::Mapped(mmap)),
                    Err(e2) => {
                        let msg2 = format!("{:#}", e2);
                        if msg2.contains(ERR_MAPPING_OOM) {
                            return Err(e2);
                        }
                        warn!("journal probe: retry failed, proceeding to scan: {:#}", e2);
                        return Ok(ProbeResult::UseFile);
                    }
                }
            }
            warn!("journal probe: replay failed, proceeding to scan: {:#}", e);
            Ok(ProbeResult::UseFile)
        }
    }
}

fn replay_cow(root: &Path, ignore_invalid: bool) -> Result<MmapMut> {
    let mut pager = Pager::open_cow(root)?;
    let report = journal_replay(
        &mut pager,
        ReplayOptions {
            ignore_invalid,
            truncate_after: false,
        },
    )?;
    info!(
        "journal probe: cow replay applied {} image(s) (max_lsn={})",
        report.applied, report.max_lsn
    );
    pager
        .into_cow_mmap()
        .ok_or_else(|| anyhow::anyhow!("pager lost its copy-on-write mapping"))
}

fn replay_direct(root: &Path, ignore_invalid: bool) -> Result<usize> {
    let mut pager = Pager::open(root)?;
    let report = journal_replay(
        &mut pager,
        ReplayOptions {
            ignore_invalid,
            truncate_after: false,
        },
    )?;
    Ok(report.applied)
}

/// Расширить data-файл до длины, которую требуют образы в журнале.
/// Журнал читается терпимо (как в реплее): битый хвост просто обрывает обход.
fn grow_data_file(root: &Path) -> Result<()> {
    let needed = journal_required_len(root)?;
    let path = root.join(DATA_FILE);
    let f = OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| format!("open data file {}", path.display()))?;
    let cur = f.metadata()?.len();
    if needed > cur {
        info!(
            "journal probe: extending {} from {} to {} bytes",
            path.display(),
            cur,
            needed
        );
        f.set_len(needed)?;
        f.sync_all()?;
    }
    Ok(())
}

/// Максимальный конец (в байтах) среди образов страниц журнала.
fn journal_required_len(root: &Path) -> Result<u64> {
    let path = journal_path(root);
    let mut f = OpenOptions::new()
        .read(true)
        .open(&path)
        .with_context(|| format!("open journal {}", path.display()))?;
    let len = f.metadata()?.len();
    let page_size = crate::meta::read_meta(root)?.page_size as u64;
    let mut pos = WAL_HDR_SIZE as u64;
    let mut needed: u64 = 0;

    while pos + (WAL_REC_HDR_SIZE as u64) <= len {
        f.seek(SeekFrom::Start(pos))?;
        let mut hdr = [0u8; WAL_REC_HDR_SIZE];
        if f.read_exact(&mut hdr).is_err() {
            break;
        }
        let payload_len =
            LittleEndian::read_u32(&hdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4]) as u64;
        let rec_total = WAL_REC_HDR_SIZE as u64 + payload_len;
        if pos + rec_total > len {
            break;
        }
        if hdr[0] == WAL_REC_PAGE_IMAGE {
            let mut payload = vec![0u8; payload_len as usize];
            f.read_exact(&mut payload)?;
            let crc_expected =
                LittleEndian::read_u32(&hdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4]);
            if crc32_of_parts(&hdr[..WAL_REC_OFF_CRC32], &payload) != crc_expected {
                break;
            }
            let page_id =
                LittleEndian::read_u64(&hdr[WAL_REC_OFF_PAGE_ID..WAL_REC_OFF_PAGE_ID + 8]);
            // Номер страницы не заслуживает доверия: переполнение смещения
            // означает мусорную запись, обход на ней заканчивается
            let end = match page_id
                .checked_mul(page_size)
                .and_then(|off| off.checked_add(payload_len))
            {
                Some(e) => e,
                None => break,
            };
            if end > needed {
                needed = end;
            }
        }
        pos += rec_total;
    }
    Ok(needed)
}
