//! journal/writer — запись закоммиченных батчей в журнал.
//!
//! Протокол батча: BEGIN(lsn) / PAGE_IMAGE(lsn, page, bytes)* / COMMIT(lsn),
//! затем единственный fsync. Реплей применяет образы только при наличии
//! COMMIT, поэтому упавший посреди батча процесс ничего не портит.

use anyhow::{Context, Result};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use crate::consts::{
    WAL_HDR_SIZE, WAL_REC_BEGIN, WAL_REC_COMMIT, WAL_REC_PAGE_IMAGE, WAL_ROTATE_SIZE,
};
use crate::pager::PageImage;

use super::{journal_path, write_journal_file_header, write_record};

pub struct Journal {
    file: File,
}

impl Journal {
    /// Открыть журнал для дозаписи; создать с заголовком, если его нет.
    pub fn open_for_append(root: &Path) -> Result<Self> {
        let path = journal_path(root);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open journal {}", path.display()))?;
        if file.metadata()?.len() < WAL_HDR_SIZE as u64 {
            write_journal_file_header(&mut file)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(Self { file })
    }

    /// Записать батч целиком и fsync'нуть журнал.
    pub fn append_batch(&mut self, lsn: u64, images: &[PageImage]) -> Result<()> {
        write_record(&mut self.file, WAL_REC_BEGIN, lsn, 0, &[])?;
        for img in images {
            write_record(
                &mut self.file,
                WAL_REC_PAGE_IMAGE,
                lsn,
                img.page_number,
                &img.bytes,
            )?;
        }
        write_record(&mut self.file, WAL_REC_COMMIT, lsn, 0, &[])?;
        self.file.sync_all()?;
        debug!(
            "journal: batch lsn={} committed ({} page image(s))",
            lsn,
            images.len()
        );
        Ok(())
    }

    /// Усечь журнал до заголовка, если он перерос порог.
    /// Вызывать только после fsync data-файла: образы батча уже на месте.
    pub fn maybe_truncate(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len > WAL_ROTATE_SIZE {
            debug!("journal: truncate to header ({} -> {})", len, WAL_HDR_SIZE);
            self.file.set_len(WAL_HDR_SIZE as u64)?;
            self.file.sync_all()?;
            self.file.seek(SeekFrom::Start(WAL_HDR_SIZE as u64))?;
        }
        Ok(())
    }
}
