//! pager/core — сырой менеджер страниц поверх единственного data-файла.
//!
//! Режимы:
//! - Direct: чтение/запись через файл (обычная работа стора);
//! - CowProbe: файл отображён copy-on-write (memmap2 map_copy) — записи видны
//!   только внутри процесса. Используется попыткой journal-replay в recovery,
//!   чтобы не трогать оригинальный файл.
//!
//! В CowProbe запись за пределы отображения невозможна: отображение фиксировано
//! длиной файла на момент open. Такая запись возвращает ошибку с фразой
//! ERR_DATA_FILE_MUST_GROW — recovery удлиняет файл и повторяет попытку.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::consts::{DATA_FILE, ERR_DATA_FILE_MUST_GROW, ERR_MAPPING_OOM};
use crate::meta::{read_meta, MetaHeader};

/// Способ доступа к data-файлу.
pub enum PagerMode {
    Direct,
    /// Copy-on-write отображение: записи не достигают диска.
    CowProbe(MmapMut),
}

/// Низкоуровневый менеджер страниц.
pub struct Pager {
    pub root: PathBuf,
    pub meta: MetaHeader,
    file: File,
    mode: PagerMode,
    // fsync данных при записи страницы
    pub(crate) data_fsync: bool,
}

impl Pager {
    /// Открыть pager в прямом режиме.
    pub fn open(root: &Path) -> Result<Self> {
        let meta = read_meta(root)?;
        let path = root.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open data file {}", path.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            meta,
            file,
            mode: PagerMode::Direct,
            data_fsync: true,
        })
    }

    /// Открыть pager в copy-on-write режиме (journal-replay probe).
    pub fn open_cow(root: &Path) -> Result<Self> {
        let meta = read_meta(root)?;
        let path = root.join(DATA_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open data file {}", path.display()))?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(anyhow!(
                "{}: data file {} is empty, required at least one page",
                ERR_DATA_FILE_MUST_GROW,
                path.display()
            ));
        }
        // map_copy: приватное отображение, записи не попадают в файл
        let mmap = unsafe { MmapOptions::new().map_copy(&file) }
            .map_err(|e| anyhow!("{}: {}", ERR_MAPPING_OOM, e))?;
        Ok(Self {
            root: root.to_path_buf(),
            meta,
            file,
            mode: PagerMode::CowProbe(mmap),
            data_fsync: false,
        })
    }

    /// Создать пустой data-файл (вместе с write_meta_new на уровне Env).
    pub fn create_data_file(root: &Path) -> Result<()> {
        let path = root.join(DATA_FILE);
        if path.exists() {
            return Err(anyhow!("data file already exists at {}", path.display()));
        }
        let f = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create data file {}", path.display()))?;
        f.sync_all()?;
        Ok(())
    }

    pub fn set_data_fsync(&mut self, on: bool) {
        self.data_fsync = on;
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.meta.page_size as usize
    }

    /// Байтовое смещение страницы. Номер может прийти из битого журнала,
    /// поэтому арифметика только checked: переполнение — ошибка, не wrap.
    #[inline]
    fn offset_of(&self, page_number: u64) -> Result<u64> {
        page_number
            .checked_mul(self.meta.page_size as u64)
            .ok_or_else(|| anyhow!("page number {} out of range", page_number))
    }

    /// Физическая длина data-файла.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Гарантировать, что страницы [page_number .. page_number+count) есть на диске.
    pub fn ensure_allocated(&mut self, page_number: u64, count: usize) -> Result<()> {
        let span_bytes = (count as u64)
            .checked_mul(self.meta.page_size as u64)
            .ok_or_else(|| anyhow!("page count {} out of range", count))?;
        let need = self
            .offset_of(page_number)?
            .checked_add(span_bytes)
            .ok_or_else(|| anyhow!("page number {} out of range", page_number))?;
        match &self.mode {
            PagerMode::Direct => {
                if self.file.metadata()?.len() < need {
                    self.file.set_len(need)?;
                    if self.data_fsync {
                        let _ = self.file.sync_all();
                    }
                }
                let end = page_number.saturating_add(count as u64);
                if end > self.meta.next_page_id {
                    self.meta.next_page_id = end;
                }
                Ok(())
            }
            PagerMode::CowProbe(mmap) => {
                if (mmap.len() as u64) < need {
                    Err(anyhow!(
                        "{}: required {} bytes, mapped {}",
                        ERR_DATA_FILE_MUST_GROW,
                        need,
                        mmap.len()
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Выделить span из count подряд идущих страниц; вернуть номер первой.
    pub fn allocate_pages(&mut self, count: usize) -> Result<u64> {
        let first = self.meta.next_page_id;
        self.ensure_allocated(first, count)?;
        Ok(first)
    }

    /// Прочитать span сырых байт (count страниц) без какой-либо проверки.
    pub fn read_span_raw(&self, page_number: u64, buf: &mut [u8]) -> Result<()> {
        let ps = self.page_size();
        if buf.len() % ps != 0 || buf.is_empty() {
            return Err(anyhow!(
                "span buffer size {} is not a positive multiple of page_size {}",
                buf.len(),
                ps
            ));
        }
        let off = self.offset_of(page_number)?;
        match &self.mode {
            PagerMode::Direct => {
                let mut f = &self.file;
                f.seek(SeekFrom::Start(off))?;
                f.read_exact(buf).with_context(|| {
                    format!("read {} bytes of page {}", buf.len(), page_number)
                })?;
                Ok(())
            }
            PagerMode::CowProbe(mmap) => {
                let start = off as usize;
                let end = start
                    .checked_add(buf.len())
                    .filter(|&e| e <= mmap.len())
                    .ok_or_else(|| {
                        anyhow!(
                            "read past end of mapping (page {}, need {} bytes)",
                            page_number,
                            buf.len()
                        )
                    })?;
                buf.copy_from_slice(&mmap[start..end]);
                Ok(())
            }
        }
    }

    /// Записать span сырых байт «как есть».
    pub fn write_span_raw(&mut self, page_number: u64, buf: &[u8]) -> Result<()> {
        let ps = self.page_size();
        if buf.len() % ps != 0 || buf.is_empty() {
            return Err(anyhow!(
                "span buffer size {} is not a positive multiple of page_size {}",
                buf.len(),
                ps
            ));
        }
        self.ensure_allocated(page_number, buf.len() / ps)?;
        let off = self.offset_of(page_number)?;
        match &mut self.mode {
            PagerMode::Direct => {
                self.file.seek(SeekFrom::Start(off))?;
                self.file.write_all(buf)?;
                if self.data_fsync {
                    let _ = self.file.sync_all();
                }
                Ok(())
            }
            PagerMode::CowProbe(mmap) => {
                let start = off as usize;
                let end = start + buf.len();
                // ensure_allocated выше уже проверил границы отображения
                mmap[start..end].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    /// Забрать CoW-отображение (с применёнными записями) у pager'а.
    pub fn into_cow_mmap(self) -> Option<MmapMut> {
        match self.mode {
            PagerMode::CowProbe(mmap) => Some(mmap),
            PagerMode::Direct => None,
        }
    }

    pub fn sync(&self) -> Result<()> {
        match &self.mode {
            PagerMode::Direct => {
                self.file.sync_all()?;
            }
            PagerMode::CowProbe(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{write_meta_new, MetaHeader};
    use std::fs;
    use std::path::PathBuf;

    fn unique_root(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let p = std::env::temp_dir().join(format!("vldb-pcore-{}-{}", tag, nanos));
        fs::create_dir_all(&p).unwrap();
        p
    }

    fn new_store(root: &Path, pages: usize) {
        write_meta_new(
            root,
            &MetaHeader {
                page_size: 4096,
                ..MetaHeader::default()
            },
        )
        .unwrap();
        Pager::create_data_file(root).unwrap();
        let f = OpenOptions::new()
            .write(true)
            .open(root.join(DATA_FILE))
            .unwrap();
        f.set_len((pages * 4096) as u64).unwrap();
    }

    #[test]
    fn cow_writes_stay_private_to_the_mapping() {
        let root = unique_root("cowpriv");
        new_store(&root, 1);
        let before = fs::read(root.join(DATA_FILE)).unwrap();

        let mut pager = Pager::open_cow(&root).unwrap();
        let page = vec![0xEEu8; 4096];
        pager.write_span_raw(0, &page).unwrap();

        // В отображении запись видна, файл не изменился
        let mmap = pager.into_cow_mmap().unwrap();
        assert!(mmap[..].iter().all(|&b| b == 0xEE));
        assert_eq!(before, fs::read(root.join(DATA_FILE)).unwrap());
    }

    #[test]
    fn out_of_range_page_number_is_an_error_not_a_wrap() {
        let root = unique_root("hugepage");
        new_store(&root, 1);
        let mut pager = Pager::open(&root).unwrap();

        let huge = u64::MAX / 2;
        let mut buf = vec![0u8; 4096];
        assert!(pager.read_span_raw(huge, &mut buf).is_err());
        assert!(pager.write_span_raw(huge, &buf).is_err());
        // Файл не вырос от «записи» по мусорному номеру
        assert_eq!(pager.file_len().unwrap(), 4096);
    }
}
