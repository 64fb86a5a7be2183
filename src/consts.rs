//! Общие константы форматов (meta, data file, pages, raw-data entries,
//! stream chunks, журнал).

// -------- Meta --------
pub const META_MAGIC: &[u8; 8] = b"VLDBMETA";
pub const META_FILE: &str = "meta";
pub const META_VERSION: u32 = 1;

/// Флаг формата: страницы зашифрованы (AEAD вместо checksum).
pub const META_FLAG_ENCRYPTED: u32 = 0x1;

// -------- Data file --------
pub const DATA_FILE: &str = "data.vldb";

pub const DEFAULT_PAGE_SIZE: u32 = 8192;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 1 << 20;

pub const NO_PAGE: u64 = u64::MAX;

// -------- Page header (64 байта, LE) --------
// [page_number u64][flags u8][pad3][overflow_size u32]
// [checksum u64][nonce 16][mac 16][reserved 8]
//
// В encrypted-режиме поле checksum не используется как контрольная сумма:
// его 8 байт служат префиксом 24-байтового XChaCha-nonce (см. crypto::full_nonce).
pub const PAGE_HDR_SIZE: usize = 64;

pub const OFF_PAGE_NUMBER: usize = 0;
pub const OFF_FLAGS: usize = 8;
pub const OFF_OVERFLOW_SIZE: usize = 12;
pub const OFF_CHECKSUM: usize = 16;
pub const OFF_NONCE: usize = 24;
pub const OFF_MAC: usize = 40;

pub const NONCE_SIZE: usize = 16;
pub const MAC_SIZE: usize = 16;
/// Полный AEAD-nonce: 8 байт перед полем nonce + сам nonce (24 байта).
pub const FULL_NONCE_SIZE: usize = 24;
pub const FULL_NONCE_OFF: usize = OFF_NONCE - 8; // == OFF_CHECKSUM
/// AAD: первые 16 байт заголовка (page_number, flags, overflow_size).
pub const AEAD_AAD_LEN: usize = 16;

// -------- Page flags --------
pub const PAGE_FLAG_SINGLE: u8 = 0x01;
pub const PAGE_FLAG_OVERFLOW: u8 = 0x02;
pub const PAGE_FLAG_RAW_DATA: u8 = 0x04;
pub const PAGE_FLAG_STREAM: u8 = 0x08;

// -------- Raw-data small page --------
// Заголовок секции сразу после общего заголовка страницы:
// [next_allocation u16][number_of_entries u16][pad4]
pub const RAW_SMALL_OFF_NEXT_ALLOCATION: usize = PAGE_HDR_SIZE;
pub const RAW_SMALL_OFF_NUM_ENTRIES: usize = PAGE_HDR_SIZE + 2;
pub const RAW_SMALL_HDR_END: usize = PAGE_HDR_SIZE + 8;

// Заголовок записи (8 байт): [allocated u16][used u16][table_type u8][pad3]
pub const RAW_ENTRY_HDR_SIZE: usize = 8;
pub const RAW_ENTRY_OFF_ALLOCATED: usize = 0;
pub const RAW_ENTRY_OFF_USED: usize = 2;
pub const RAW_ENTRY_OFF_TABLE_TYPE: usize = 4;

// -------- Table types (raw-data payload dispatch) --------
pub const TABLE_TYPE_DOCUMENTS: u8 = 1;
pub const TABLE_TYPE_REVISIONS: u8 = 2;
pub const TABLE_TYPE_CONFLICTS: u8 = 3;
pub const TABLE_TYPE_COUNTERS: u8 = 4;

// -------- Stream pages (chunked attachments) --------
// Stream-заголовок (32 байта) сразу после общего заголовка страницы:
// [chunk_size u64][next_page u64][stream_flags u32][pad12]
pub const STREAM_HDR_SIZE: usize = 32;
pub const STREAM_OFF_CHUNK_SIZE: usize = PAGE_HDR_SIZE;
pub const STREAM_OFF_NEXT_PAGE: usize = PAGE_HDR_SIZE + 8;
pub const STREAM_OFF_FLAGS: usize = PAGE_HDR_SIZE + 16;
pub const STREAM_DATA_START: usize = PAGE_HDR_SIZE + STREAM_HDR_SIZE;

/// Голова цепочки stream-страниц. Остальные страницы цепочки сканер
/// пропускает без fault'а.
pub const STREAM_FLAG_FIRST: u32 = 0x1;

// -------- Журнал (WAL) --------
pub const WAL_FILE: &str = "wal-000001.log";
pub const WAL_MAGIC: &[u8; 8] = b"VLWAL001";
pub const WAL_HDR_SIZE: usize = 16;

// Формат записи журнала:
// [type u8][flags u8][reserved u16][lsn u64][page_id u64][len u32][crc32 u32]
// Итого 28 байт заголовка; crc32 по заголовку (без поля crc) + payload.
pub const WAL_REC_HDR_SIZE: usize = 28;

pub const WAL_REC_BEGIN: u8 = 1;
pub const WAL_REC_PAGE_IMAGE: u8 = 2;
pub const WAL_REC_COMMIT: u8 = 3;

pub const WAL_REC_OFF_TYPE: usize = 0;
pub const WAL_REC_OFF_LSN: usize = 4;
pub const WAL_REC_OFF_PAGE_ID: usize = 12;
pub const WAL_REC_OFF_LEN: usize = 20;
pub const WAL_REC_OFF_CRC32: usize = 24;

// Порог очистки журнала (байт): при превышении после коммита — truncate до заголовка.
pub const WAL_ROTATE_SIZE: u64 = 8 * 1024 * 1024;

// -------- Recovery --------
/// Подряд идущие страницы с несошедшейся checksum и ненулевой MAC-областью,
/// после которых скан прерывается: файл почти наверняка зашифрован, а ключ
/// не задан или неверен.
pub const WRONG_KEY_FATAL_STREAK: u32 = 128;

// Коды завершения процесса vellum_recover.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CANCELLED: i32 = 2;
pub const EXIT_MISSING_MASTER_KEY: i32 = 3;
pub const EXIT_DISABLE_COW_REQUIRED: i32 = 4;

// Стабильные фразы ошибок, по которым ветвится recovery (см. recovery/journal.rs).
pub const ERR_DATA_FILE_MUST_GROW: &str = "data file must grow";
pub const ERR_MAPPING_OOM: &str = "copy-on-write mapping allocation failed";
pub const ERR_MISSING_MASTER_KEY: &str = "master key is missing or incorrect";
