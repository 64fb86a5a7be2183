// src/meta.rs — заголовок стора (meta v1)
//
// Формат <root>/meta (LE):
// MAGIC8 = "VLDBMETA"
// u32 version        = 1
// u32 page_size      (512..=1 MiB, power of two)
// u32 flags          (META_FLAG_ENCRYPTED, ...)
// u64 next_page_id
// u64 last_lsn
// u8  clean_shutdown (1=clean, 0=unclean)
//
// Политика:
// - Атомарная запись: tmp+rename, затем fsync родительского каталога.
// - validate_page_size: 512..=1MiB, степень двойки.
// - Журнал при открытии опирается на last_lsn/clean_shutdown.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, OpenOptions};
#[cfg(unix)]
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::{
    MAX_PAGE_SIZE, META_FILE, META_FLAG_ENCRYPTED, META_MAGIC, META_VERSION, MIN_PAGE_SIZE,
};

#[derive(Debug, Clone)]
pub struct MetaHeader {
    pub version: u32,   // == 1
    pub page_size: u32, // 512 .. 1 MiB (power of two)
    pub flags: u32,
    pub next_page_id: u64,
    pub last_lsn: u64,
    pub clean_shutdown: bool,
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self {
            version: META_VERSION,
            page_size: crate::consts::DEFAULT_PAGE_SIZE,
            flags: 0,
            next_page_id: 0,
            last_lsn: 0,
            clean_shutdown: true,
        }
    }
}

impl MetaHeader {
    #[inline]
    pub fn encrypted(&self) -> bool {
        self.flags & META_FLAG_ENCRYPTED != 0
    }
}

// ---- Внутренние утилиты ----

#[inline]
fn meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Проверка корректности размера страницы (2^n, 512 B .. 1 MiB).
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if page_size < MIN_PAGE_SIZE
        || page_size > MAX_PAGE_SIZE
        || (page_size & (page_size - 1)) != 0
    {
        return Err(anyhow!(
            "page_size must be a power of two in [{} .. {}], got {}",
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE,
            page_size
        ));
    }
    Ok(())
}

// ---- Запись/чтение ----

/// Создать новый meta. Ошибка, если уже существует.
pub fn write_meta_new(root: &Path, h: &MetaHeader) -> Result<()> {
    validate_page_size(h.page_size)?;

    let path = meta_path(root);
    if path.exists() {
        return Err(anyhow!("meta already exists at {}", path.display()));
    }
    write_meta_tmp_rename(root, h)
}

/// Перезаписать meta через tmp+rename.
pub fn write_meta_overwrite(root: &Path, h: &MetaHeader) -> Result<()> {
    validate_page_size(h.page_size)?;
    write_meta_tmp_rename(root, h)
}

fn write_meta_tmp_rename(root: &Path, h: &MetaHeader) -> Result<()> {
    let path = meta_path(root);
    let tmp = root.join(format!("{}.tmp", META_FILE));
    let _ = fs::remove_file(&tmp); // best-effort

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .with_context(|| format!("open meta tmp {}", tmp.display()))?;

    f.seek(SeekFrom::Start(0))?;
    f.write_all(META_MAGIC)?;
    f.write_u32::<LittleEndian>(h.version)?;
    f.write_u32::<LittleEndian>(h.page_size)?;
    f.write_u32::<LittleEndian>(h.flags)?;
    f.write_u64::<LittleEndian>(h.next_page_id)?;
    f.write_u64::<LittleEndian>(h.last_lsn)?;
    f.write_u8(if h.clean_shutdown { 1 } else { 0 })?;
    f.sync_all()?;

    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    let _ = fsync_dir(&path);
    Ok(())
}

/// Прочитать meta.
pub fn read_meta(root: &Path) -> Result<MetaHeader> {
    let path = meta_path(root);
    let mut f = OpenOptions::new()
        .read(true)
        .open(&path)
        .with_context(|| format!("open meta {}", path.display()))?;

    let mut magic = [0u8; 8];
    f.read_exact(&mut magic)?;
    if &magic != META_MAGIC {
        return Err(anyhow!(
            "bad meta magic at {} (expected {:?}, got {:?})",
            path.display(),
            META_MAGIC,
            magic
        ));
    }

    let version = f.read_u32::<LittleEndian>()?;
    if version != META_VERSION {
        return Err(anyhow!(
            "unsupported meta version {} at {} (expected {})",
            version,
            path.display(),
            META_VERSION
        ));
    }

    let page_size = f.read_u32::<LittleEndian>()?;
    let flags = f.read_u32::<LittleEndian>()?;
    let next_page_id = f.read_u64::<LittleEndian>()?;
    let last_lsn = f.read_u64::<LittleEndian>()?;
    let clean_shutdown = f.read_u8()? != 0;

    Ok(MetaHeader {
        version,
        page_size,
        flags,
        next_page_id,
        last_lsn,
        clean_shutdown,
    })
}

/// Пометить meta.clean_shutdown (только при изменении).
pub fn set_clean_shutdown(root: &Path, clean: bool) -> Result<()> {
    let mut m = read_meta(root)?;
    if m.clean_shutdown != clean {
        m.clean_shutdown = clean;
        write_meta_overwrite(root, &m)?;
    }
    Ok(())
}

/// Обновить last_lsn, если new_lsn больше текущего.
pub fn set_last_lsn(root: &Path, new_lsn: u64) -> Result<()> {
    let mut m = read_meta(root)?;
    if new_lsn > m.last_lsn {
        m.last_lsn = new_lsn;
        write_meta_overwrite(root, &m)?;
    }
    Ok(())
}
