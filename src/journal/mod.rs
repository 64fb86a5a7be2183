//! journal — WAL (VLWAL001) для атомарности батч-коммитов.
//!
//! Разделение:
//! - writer.rs — Journal: запись батча BEGIN / PAGE_IMAGE* / COMMIT одним
//!   fsync, усечение после порога.
//! - replay.rs — journal_replay: реплей с CRC-гейтингом, применяются только
//!   закоммиченные батчи; частичный хвост — нормальный конец файла.
//!
//! Здесь (mod.rs): кодирование кадра (28-байтовый заголовок + CRC32 по
//! заголовку без поля crc + payload) и путь к файлу журнала.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::{
    WAL_FILE, WAL_MAGIC, WAL_REC_HDR_SIZE, WAL_REC_OFF_CRC32, WAL_REC_OFF_LEN, WAL_REC_OFF_LSN,
    WAL_REC_OFF_PAGE_ID, WAL_REC_OFF_TYPE,
};

mod replay;
mod writer;

pub use replay::{journal_replay, ReplayOptions, ReplayReport};
pub use writer::Journal;

pub fn journal_path(root: &Path) -> PathBuf {
    root.join(WAL_FILE)
}

/// CRC32 по двум срезам без промежуточного буфера.
#[inline]
pub fn crc32_of_parts(head_without_crc: &[u8], payload: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(head_without_crc);
    h.update(payload);
    h.finalize()
}

/// Построить 28-байтовый заголовок кадра с заполненным CRC.
pub fn build_record_header(
    rec_type: u8,
    lsn: u64,
    page_id: u64,
    payload: &[u8],
) -> [u8; WAL_REC_HDR_SIZE] {
    let mut hdr = [0u8; WAL_REC_HDR_SIZE];
    hdr[WAL_REC_OFF_TYPE] = rec_type;
    LittleEndian::write_u64(&mut hdr[WAL_REC_OFF_LSN..WAL_REC_OFF_LSN + 8], lsn);
    LittleEndian::write_u64(
        &mut hdr[WAL_REC_OFF_PAGE_ID..WAL_REC_OFF_PAGE_ID + 8],
        page_id,
    );
    LittleEndian::write_u32(
        &mut hdr[WAL_REC_OFF_LEN..WAL_REC_OFF_LEN + 4],
        payload.len() as u32,
    );
    let crc = crc32_of_parts(&hdr[..WAL_REC_OFF_CRC32], payload);
    LittleEndian::write_u32(&mut hdr[WAL_REC_OFF_CRC32..WAL_REC_OFF_CRC32 + 4], crc);
    hdr
}

/// Записать кадр [header][payload] по текущей позиции writer'а.
pub fn write_record<W: Write>(
    writer: &mut W,
    rec_type: u8,
    lsn: u64,
    page_id: u64,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(anyhow!(
            "journal payload too large: {} bytes (len field is u32)",
            payload.len()
        ));
    }
    let hdr = build_record_header(rec_type, lsn, page_id, payload);
    writer.write_all(&hdr)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    Ok(())
}

/// Записать 16-байтовый заголовок файла журнала (magic + reserved).
pub fn write_journal_file_header(f: &mut File) -> Result<()> {
    f.seek(SeekFrom::Start(0))?;
    f.write_all(WAL_MAGIC)?;
    f.write_all(&[0u8; 8])?;
    Ok(())
}
