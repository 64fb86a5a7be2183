#![allow(non_snake_case)]

// Базовые модули
pub mod config;
pub mod consts;
pub mod meta;
pub mod util;

// Криптография (master key, per-page субключи, content hash)
pub mod crypto; // src/crypto/mod.rs

// Страницы и pager
pub mod page; // src/page/{mod,checksum,aead}.rs
pub mod pager; // src/pager/{mod,core,buffer_pool,page_cache,crypto}.rs

// Журнал и транзакции
pub mod env;
pub mod journal; // src/journal/{mod,writer,replay}.rs
pub mod txn;

// Офлайновое восстановление
pub mod recovery; // src/recovery/{mod,journal,scanner,entities,storage}.rs

// Удобные реэкспорты
pub use config::VellumConfig;
pub use env::{Env, EnvOptions};
pub use meta::{
    read_meta, set_clean_shutdown, set_last_lsn, validate_page_size, write_meta_new,
    write_meta_overwrite, MetaHeader,
};
pub use txn::Transaction;

// Реэкспорты crypto API
pub use crypto::{content_hash, derive_page_key, MasterKey};

// Реэкспорты recovery API
pub use recovery::{
    ExecutionStatus, Recovery, RecoveryConfig, RecoveryOutcome, RecoverySink, RecoveryStorage,
};
