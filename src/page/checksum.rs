//! page/checksum — 8-байтовая контрольная сумма страницы (cleartext-режим).
//!
//! - checksum = XxHash64(seed=0) по всему span'у аллокации с занулённым полем
//!   checksum (байты [16..24) заголовка);
//! - для overflow-аллокаций span покрывает все страницы цепочки целиком;
//! - stored == 0 трактуется как «страница не инициализирована» и валидной
//!   НЕ считается: сканер должен отличать пустоту от целостности.
//!
//! В encrypted-режиме поле checksum не используется — целостность даёт
//! AEAD-тег (см. page/aead.rs).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::hash::Hasher;

use crate::consts::OFF_CHECKSUM;

/// Посчитать checksum span'а как если бы поле checksum было нулевым.
pub fn page_checksum_compute(span: &[u8]) -> Result<u64> {
    if span.len() < OFF_CHECKSUM + 8 {
        return Err(anyhow!("page buffer too small for checksum"));
    }
    let mut h = twox_hash::XxHash64::with_seed(0);
    h.write(&span[..OFF_CHECKSUM]);
    h.write(&[0u8; 8]);
    h.write(&span[OFF_CHECKSUM + 8..]);
    Ok(h.finish())
}

/// Обновить поле checksum в заголовке.
pub fn page_update_checksum(span: &mut [u8]) -> Result<()> {
    let digest = page_checksum_compute(span)?;
    LittleEndian::write_u64(&mut span[OFF_CHECKSUM..OFF_CHECKSUM + 8], digest);
    Ok(())
}

/// Проверить checksum. true = совпала (и stored != 0).
pub fn page_verify_checksum(span: &[u8]) -> Result<bool> {
    if span.len() < OFF_CHECKSUM + 8 {
        return Err(anyhow!("page buffer too small for checksum verify"));
    }
    let stored = LittleEndian::read_u64(&span[OFF_CHECKSUM..OFF_CHECKSUM + 8]);
    if stored == 0 {
        return Ok(false);
    }
    Ok(stored == page_checksum_compute(span)?)
}
