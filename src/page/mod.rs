//! page — общий 64-байтовый заголовок страницы и производные величины.
//!
//! Раскладка заголовка — см. consts.rs. Сканер восстановления не доверяет
//! ничему, кроме этих полей, checksum и MAC, поэтому все чтения здесь
//! ограничены границами буфера и не паникуют.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    OFF_FLAGS, OFF_MAC, OFF_OVERFLOW_SIZE, OFF_PAGE_NUMBER, MAC_SIZE, PAGE_FLAG_OVERFLOW,
    PAGE_FLAG_RAW_DATA, PAGE_FLAG_SINGLE, PAGE_FLAG_STREAM, PAGE_HDR_SIZE,
};

mod aead;
mod checksum;

pub use aead::{page_decrypt_in_place, page_encrypt_in_place};
pub use checksum::{page_checksum_compute, page_update_checksum, page_verify_checksum};

/// Разобранный заголовок страницы.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub page_number: u64,
    pub flags: u8,
    pub overflow_size: u32,
}

impl PageHeader {
    #[inline]
    pub fn is_single(&self) -> bool {
        self.flags & PAGE_FLAG_SINGLE != 0
    }
    #[inline]
    pub fn is_overflow(&self) -> bool {
        self.flags & PAGE_FLAG_OVERFLOW != 0
    }
    #[inline]
    pub fn is_raw_data(&self) -> bool {
        self.flags & PAGE_FLAG_RAW_DATA != 0
    }
    #[inline]
    pub fn is_stream(&self) -> bool {
        self.flags & PAGE_FLAG_STREAM != 0
    }

    /// Сколько страниц занимает эта аллокация.
    pub fn number_of_pages(&self, page_size: usize) -> usize {
        if self.is_overflow() {
            pages_for_overflow(self.overflow_size, page_size)
        } else {
            1
        }
    }
}

/// Страниц под overflow-значение данного размера (заголовок + payload).
#[inline]
pub fn pages_for_overflow(overflow_size: u32, page_size: usize) -> usize {
    let total = PAGE_HDR_SIZE + overflow_size as usize;
    total.div_ceil(page_size).max(1)
}

/// Прочитать заголовок (первые 64 байта буфера).
pub fn page_header_read(buf: &[u8]) -> Result<PageHeader> {
    if buf.len() < PAGE_HDR_SIZE {
        return Err(anyhow!("page buffer too small for header"));
    }
    Ok(PageHeader {
        page_number: LittleEndian::read_u64(&buf[OFF_PAGE_NUMBER..OFF_PAGE_NUMBER + 8]),
        flags: buf[OFF_FLAGS],
        overflow_size: LittleEndian::read_u32(&buf[OFF_OVERFLOW_SIZE..OFF_OVERFLOW_SIZE + 4]),
    })
}

/// Записать заголовок (не трогает checksum/nonce/mac).
pub fn page_header_write(buf: &mut [u8], h: &PageHeader) -> Result<()> {
    if buf.len() < PAGE_HDR_SIZE {
        return Err(anyhow!("page buffer too small for header"));
    }
    LittleEndian::write_u64(&mut buf[OFF_PAGE_NUMBER..OFF_PAGE_NUMBER + 8], h.page_number);
    buf[OFF_FLAGS] = h.flags;
    LittleEndian::write_u32(
        &mut buf[OFF_OVERFLOW_SIZE..OFF_OVERFLOW_SIZE + 4],
        h.overflow_size,
    );
    Ok(())
}

/// MAC-область содержит хоть один ненулевой байт?
/// Используется сканером как эвристика «страница, похоже, зашифрована».
pub fn page_mac_is_nonzero(buf: &[u8]) -> bool {
    if buf.len() < OFF_MAC + MAC_SIZE {
        return false;
    }
    buf[OFF_MAC..OFF_MAC + MAC_SIZE].iter().any(|&b| b != 0)
}

/// Удобный конструктор флагов для raw-data страниц.
#[inline]
pub fn raw_data_flags(overflow: bool) -> u8 {
    if overflow {
        PAGE_FLAG_RAW_DATA | PAGE_FLAG_OVERFLOW
    } else {
        PAGE_FLAG_RAW_DATA | PAGE_FLAG_SINGLE
    }
}

/// Флаги stream-страницы (всегда overflow).
#[inline]
pub fn stream_page_flags() -> u8 {
    PAGE_FLAG_STREAM | PAGE_FLAG_OVERFLOW
}
