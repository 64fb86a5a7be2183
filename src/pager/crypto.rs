//! pager/crypto — транзакционный слой расшифровки поверх сырого Pager.
//!
//! Модель:
//! - Транзакция держит ChunkArena — chunk'и-буферы из EncryptionBufferPool;
//!   все plaintext-страницы транзакции живут внутри арены и умирают с ней.
//! - CryptoTxState: page_number -> EncryptionBuffer (view в арену + SHA-256
//!   содержимого на момент загрузки).
//! - Чтение (acquire_page_pointer): сырой span с диска -> расшифровка per-page
//!   субключом (или проверка checksum в незашифрованном сторе) -> хеш.
//! - Коммит (tx_on_commit): хеш пересчитывается; совпал — страница не
//!   менялась и на диск не пишется; не совпал — копия шифруется свежим nonce
//!   (или получает новый checksum) и уходит в write-set батча.
//! - break_large_allocation: multi-page span разрезается на независимые
//!   одностраничные буферы поверх того же chunk'а. Каждый лист получает
//!   собственный single-заголовок и нулевой хеш загрузки, так что коммит
//!   перешифрует каждый под его собственным per-page ключом.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::consts::{PAGE_FLAG_OVERFLOW, PAGE_FLAG_SINGLE, PAGE_HDR_SIZE};
use crate::crypto::{content_hash, derive_page_key, MasterKey};
use crate::page::{
    page_decrypt_in_place, page_encrypt_in_place, page_header_read, page_header_write,
    page_update_checksum, page_verify_checksum, PageHeader,
};

use super::buffer_pool::{EncryptionBufferPool, PooledBuf};
use super::core::Pager;
use super::page_cache::PageRef;

/// Арена plaintext-chunk'ов одной транзакции.
/// Все PageRef транзакции указывают сюда; при Drop chunk'и возвращаются в пул.
pub struct ChunkArena {
    pool: Arc<EncryptionBufferPool>,
    chunks: Vec<PooledBuf>,
}

impl ChunkArena {
    pub fn new(pool: Arc<EncryptionBufferPool>) -> Self {
        Self {
            pool,
            chunks: Vec::new(),
        }
    }

    /// Выделить chunk не меньше `size` байт; view покрывает ровно `size`.
    pub fn allocate(&mut self, size: usize) -> PageRef {
        let buf = self.pool.get(size);
        let chunk = self.chunks.len() as u32;
        self.chunks.push(buf);
        PageRef {
            chunk,
            offset: 0,
            len: size as u32,
        }
    }

    #[inline]
    pub fn slice(&self, r: PageRef) -> &[u8] {
        let start = r.offset as usize;
        &self.chunks[r.chunk as usize].data[start..start + r.len as usize]
    }

    #[inline]
    pub fn slice_mut(&mut self, r: PageRef) -> &mut [u8] {
        let start = r.offset as usize;
        &mut self.chunks[r.chunk as usize].data[start..start + r.len as usize]
    }

    #[cfg(test)]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Drop for ChunkArena {
    fn drop(&mut self) {
        for buf in self.chunks.drain(..) {
            self.pool.put(buf);
        }
    }
}

/// Учётная запись одной загруженной страницы.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionBuffer {
    pub page: PageRef,
    /// SHA-256 plaintext'а на момент загрузки (все нули у новых страниц
    /// и у частей разрезанного span'а — такие всегда попадают в write-set).
    pub hash: [u8; 32],
    /// Страница освобождена внутри транзакции; на коммите пропускается.
    pub skip_on_tx_commit: bool,
}

/// Состояние шифрослоя одной пишущей транзакции.
#[derive(Default)]
pub struct CryptoTxState {
    buffers: BTreeMap<u64, EncryptionBuffer>,
}

impl CryptoTxState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, page_number: u64) -> Option<&EncryptionBuffer> {
        self.buffers.get(&page_number)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Пометить страницу освобождённой: загруженный буфер остаётся валиден
    /// до конца транзакции, но на диск не пойдёт.
    pub fn skip_on_commit(&mut self, page_number: u64) {
        if let Some(b) = self.buffers.get_mut(&page_number) {
            b.skip_on_tx_commit = true;
        }
    }
}

/// Одна страница write-set'а, готовая к журналированию и записи.
pub struct PageImage {
    pub page_number: u64,
    pub bytes: Vec<u8>,
}

/// Слой per-page шифрования. Без master-ключа работает в checksum-режиме
/// (plaintext-страницы с XxHash64 вместо AEAD).
pub struct EncryptedPager {
    key: Option<Arc<MasterKey>>,
}

impl EncryptedPager {
    pub fn new(key: Option<Arc<MasterKey>>) -> Self {
        Self { key }
    }

    #[inline]
    pub fn encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Получить plaintext-указатель на страницу (загрузка + расшифровка при
    /// первом обращении; повторные обращения внутри транзакции бесплатны).
    pub fn acquire_page_pointer(
        &self,
        pager: &Pager,
        arena: &mut ChunkArena,
        state: &mut CryptoTxState,
        page_number: u64,
    ) -> Result<PageRef> {
        if let Some(b) = state.buffers.get(&page_number) {
            return Ok(b.page);
        }

        let ps = pager.page_size();

        // Сначала один лист: из заголовка узнаём длину span'а
        let head = arena.allocate(ps);
        pager.read_span_raw(page_number, arena.slice_mut(head))?;
        let hdr = page_header_read(arena.slice(head))?;
        if hdr.page_number != page_number {
            return Err(anyhow!(
                "page {} header carries page_number {} (torn or misdirected write)",
                page_number,
                hdr.page_number
            ));
        }
        let pages = hdr.number_of_pages(ps);

        let span = if pages == 1 {
            head
        } else {
            let full = arena.allocate(pages * ps);
            pager.read_span_raw(page_number, arena.slice_mut(full))?;
            full
        };

        match &self.key {
            Some(mk) => {
                let key = derive_page_key(mk, page_number);
                page_decrypt_in_place(arena.slice_mut(span), &key)
                    .map_err(|e| anyhow!("page {}: {}", page_number, e))?;
            }
            None => {
                if !page_verify_checksum(arena.slice(span))? {
                    return Err(anyhow!("page {}: checksum mismatch", page_number));
                }
            }
        }

        let hash = content_hash(arena.slice(span));
        state.buffers.insert(
            page_number,
            EncryptionBuffer {
                page: span,
                hash,
                skip_on_tx_commit: false,
            },
        );
        Ok(span)
    }

    /// Выделить новую страницу (count листов). Буфер занулён, заголовок несёт
    /// page_number; хеш нулевой, так что страница попадёт в write-set даже
    /// нетронутой.
    pub fn acquire_new_page(
        &self,
        pager: &mut Pager,
        arena: &mut ChunkArena,
        state: &mut CryptoTxState,
        count: usize,
        flags: u8,
    ) -> Result<(u64, PageRef)> {
        if count == 0 {
            return Err(anyhow!("cannot allocate zero pages"));
        }
        let ps = pager.page_size();
        let page_number = pager.allocate_pages(count)?;

        let span = arena.allocate(count * ps);
        let overflow_size = if count > 1 {
            (count * ps - PAGE_HDR_SIZE) as u32
        } else {
            0
        };
        page_header_write(
            arena.slice_mut(span),
            &PageHeader {
                page_number,
                flags,
                overflow_size,
            },
        )?;

        state.buffers.insert(
            page_number,
            EncryptionBuffer {
                page: span,
                hash: [0u8; 32],
                skip_on_tx_commit: false,
            },
        );
        Ok((page_number, span))
    }

    /// Разрезать multi-page аллокацию на независимые одностраничные буферы.
    /// Каждый лист (голова включительно) получает собственный single-заголовок
    /// и нулевой хеш загрузки: на коммите все части перешифровываются как
    /// самостоятельные страницы, каждая под ключом своего номера.
    /// Первые PAGE_HDR_SIZE байт каждого хвостового листа занимает новый
    /// заголовок — содержимое листов заполняет вызывающая сторона.
    pub fn break_large_allocation(
        &self,
        pager: &Pager,
        arena: &mut ChunkArena,
        state: &mut CryptoTxState,
        page_number: u64,
    ) -> Result<()> {
        let ps = pager.page_size() as u32;
        let head = *state
            .buffers
            .get(&page_number)
            .ok_or_else(|| anyhow!("page {} is not loaded in this transaction", page_number))?;
        if head.page.len <= ps {
            return Ok(()); // уже одностраничная
        }
        let pages = (head.page.len / ps) as u64;
        let flags = {
            let hdr = page_header_read(arena.slice(head.page))?;
            (hdr.flags & !PAGE_FLAG_OVERFLOW) | PAGE_FLAG_SINGLE
        };
        for i in 0..pages {
            let view = PageRef {
                chunk: head.page.chunk,
                offset: head.page.offset + (i as u32) * ps,
                len: ps,
            };
            page_header_write(
                arena.slice_mut(view),
                &PageHeader {
                    page_number: page_number + i,
                    flags,
                    overflow_size: 0,
                },
            )?;
            state.buffers.insert(
                page_number + i,
                EncryptionBuffer {
                    page: view,
                    hash: [0u8; 32],
                    skip_on_tx_commit: false,
                },
            );
        }
        Ok(())
    }

    /// Собрать write-set коммита: перешифрованные (или с обновлённым
    /// checksum) копии всех изменённых страниц. Plaintext в арене не трогаем —
    /// до конца транзакции им могут пользоваться читатели.
    pub fn tx_on_commit(
        &self,
        arena: &ChunkArena,
        state: &CryptoTxState,
    ) -> Result<Vec<PageImage>> {
        let mut out = Vec::new();
        for (&page_number, buf) in &state.buffers {
            if buf.skip_on_tx_commit {
                continue;
            }
            let span = arena.slice(buf.page);
            if content_hash(span) == buf.hash {
                continue; // не менялась
            }

            let mut bytes = span.to_vec();
            match &self.key {
                Some(mk) => {
                    let key = derive_page_key(mk, page_number);
                    page_encrypt_in_place(&mut bytes, &key)
                        .map_err(|e| anyhow!("page {}: {}", page_number, e))?;
                }
                None => {
                    page_update_checksum(&mut bytes)?;
                }
            }
            out.push(PageImage { page_number, bytes });
        }
        Ok(out)
    }
}
