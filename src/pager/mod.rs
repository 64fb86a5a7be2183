//! pager — работа со страницами поверх data-файла.
//!
//! Раскладка:
//! - core.rs        — сырой Pager (чтение/запись span'ов, аллокация, CoW-режим)
//! - buffer_pool.rs — EncryptionBufferPool (пул plaintext-буферов по size-классам)
//! - page_cache.rs  — PageLocator (direct-mapped кэш транзакции) + TransactionContextPool
//! - crypto.rs      — EncryptedPager: расшифровка при чтении, re-encrypt на коммите

mod buffer_pool;
mod core;
mod crypto;
mod page_cache;

pub use buffer_pool::{EncryptionBufferPool, PooledBuf};
pub use core::{PagerMode, Pager};
pub use crypto::{ChunkArena, CryptoTxState, EncryptedPager, EncryptionBuffer, PageImage};
pub use page_cache::{PageLocator, PageRef, TransactionContextPool};
