use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use VellumDB::consts::{DATA_FILE, PAGE_HDR_SIZE};
use VellumDB::crypto::MasterKey;
use VellumDB::page::raw_data_flags;
use VellumDB::{read_meta, Env, EnvOptions, VellumConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("vldb-{}-{}-{}", prefix, pid, t))
}

fn encrypted_opts(mk: &Arc<MasterKey>) -> EnvOptions {
    EnvOptions {
        page_size: 4096,
        master_key: Some(Arc::clone(mk)),
        ..EnvOptions::default()
    }
}

#[test]
fn encrypted_store_roundtrip_across_reopen() -> Result<()> {
    let root = unique_root("env-rt");
    let mk = Arc::new(MasterKey::from_bytes(&[7u8; 32])?);
    let opts = encrypted_opts(&mk);

    let pn;
    {
        let env = Env::create(&root, &opts)?;
        // Пока стор открыт, meta помечен нечистым
        assert!(!read_meta(&root)?.clean_shutdown);

        let mut tx = env.write_txn(false);
        let (p, r) = tx.allocate_page(1, raw_data_flags(false))?;
        tx.data_mut(r)[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 6].copy_from_slice(b"vellum");
        pn = p;
        tx.commit()?;
        env.close()?;
    }
    assert!(read_meta(&root)?.clean_shutdown);

    // На диске — шифртекст, plaintext не виден
    let raw = fs::read(root.join(DATA_FILE))?;
    assert_ne!(&raw[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 6], b"vellum");

    let env = Env::open(&root, &opts)?;
    assert!(env.encrypted());
    let mut tx = env.write_txn(false);
    let r = tx.get_page(pn)?;
    assert_eq!(&tx.data(r)[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 6], b"vellum");
    Ok(())
}

#[test]
fn key_and_flag_must_agree() -> Result<()> {
    let mk = Arc::new(MasterKey::from_bytes(&[1u8; 32])?);

    // Шифрованный стор без ключа не открывается
    let root = unique_root("env-nokey");
    {
        let env = Env::create(&root, &encrypted_opts(&mk))?;
        env.close()?;
    }
    assert!(Env::open(&root, &EnvOptions::default()).is_err());

    // И наоборот: ключ к нешифрованному стору — ошибка
    let root2 = unique_root("env-spurious-key");
    {
        let env = Env::create(&root2, &EnvOptions::default())?;
        env.close()?;
    }
    assert!(Env::open(&root2, &encrypted_opts(&mk)).is_err());
    Ok(())
}

#[test]
fn read_only_transaction_writes_nothing() -> Result<()> {
    let root = unique_root("env-ro");
    let mk = Arc::new(MasterKey::from_bytes(&[3u8; 32])?);
    let opts = encrypted_opts(&mk);

    {
        let env = Env::create(&root, &opts)?;
        let mut tx = env.write_txn(false);
        let (_, r) = tx.allocate_page(1, raw_data_flags(false))?;
        tx.data_mut(r)[PAGE_HDR_SIZE] = 0xEE;
        tx.commit()?;
        env.close()?;
    }
    let before = fs::read(root.join(DATA_FILE))?;

    {
        let env = Env::open(&root, &opts)?;
        let mut tx = env.write_txn(false);
        let r = tx.get_page(0)?;
        assert_eq!(tx.data(r)[PAGE_HDR_SIZE], 0xEE);
        // Страница загружена, но не изменена: nonce не перевыпускается
        tx.commit()?;
        env.close()?;
    }
    assert_eq!(before, fs::read(root.join(DATA_FILE))?);
    Ok(())
}

#[test]
fn rollback_discards_modifications() -> Result<()> {
    let root = unique_root("env-rb");
    let mk = Arc::new(MasterKey::from_bytes(&[5u8; 32])?);
    let opts = encrypted_opts(&mk);

    let env = Env::create(&root, &opts)?;
    {
        let mut tx = env.write_txn(false);
        let (_, r) = tx.allocate_page(1, raw_data_flags(false))?;
        tx.data_mut(r)[PAGE_HDR_SIZE] = 1;
        tx.commit()?;
    }
    {
        let mut tx = env.write_txn(false);
        let r = tx.modify_page(0)?;
        tx.data_mut(r)[PAGE_HDR_SIZE] = 99;
        tx.rollback();
    }
    {
        let mut tx = env.write_txn(false);
        let r = tx.get_page(0)?;
        assert_eq!(tx.data(r)[PAGE_HDR_SIZE], 1);
    }
    env.close()?;
    Ok(())
}

#[test]
fn central_config_feeds_env_options() -> Result<()> {
    let root = unique_root("env-cfg");
    let cfg = VellumConfig::default()
        .with_page_size(4096)
        .with_data_fsync(true)
        .build();
    let opts = EnvOptions::from_config(&cfg, None);
    assert_eq!(opts.page_size, 4096);
    assert!(opts.data_fsync);
    assert!(opts.master_key.is_none());

    let env = Env::create(&root, &opts)?;
    assert_eq!(env.page_size(), 4096);
    env.close()?;
    assert_eq!(read_meta(&root)?.page_size, 4096);
    Ok(())
}

#[test]
fn split_overflow_pages_become_independent() -> Result<()> {
    let root = unique_root("env-split");
    let mk = Arc::new(MasterKey::from_bytes(&[11u8; 32])?);
    let opts = encrypted_opts(&mk);

    let env = Env::create(&root, &opts)?;
    {
        let mut tx = env.write_txn(false);
        let (pn, r) = tx.allocate_page(3, raw_data_flags(true))?;
        assert_eq!(pn, 0);
        let span = tx.data_mut(r);
        let last = span.len() - 1;
        span[last] = 0xAB;
        tx.commit()?;
    }
    {
        let mut tx = env.write_txn(false);
        tx.get_page(0)?;
        tx.break_large_allocation(0)?;
        // Лист 2 — самостоятельный одностраничный буфер
        let r = tx.modify_page(2)?;
        assert_eq!(r.len, 4096);
        tx.data_mut(r)[PAGE_HDR_SIZE] = 0x5A;
        tx.commit()?;
    }
    env.close()?;

    // После переоткрытия каждый лист читается как отдельная страница
    let env = Env::open(&root, &opts)?;
    let mut tx = env.write_txn(false);
    let r1 = tx.get_page(1)?;
    assert_eq!(r1.len, 4096);
    let r2 = tx.get_page(2)?;
    assert_eq!(r2.len, 4096);
    assert_eq!(tx.data(r2)[PAGE_HDR_SIZE], 0x5A);
    assert_eq!(tx.data(r2)[4096 - 1], 0xAB);
    drop(tx);
    env.close()?;
    Ok(())
}

#[test]
fn overflow_allocation_roundtrip() -> Result<()> {
    let root = unique_root("env-ovf");
    let mk = Arc::new(MasterKey::from_bytes(&[9u8; 32])?);
    let opts = encrypted_opts(&mk);

    let env = Env::create(&root, &opts)?;
    {
        let mut tx = env.write_txn(false);
        let (pn, r) = tx.allocate_page(3, raw_data_flags(true))?;
        assert_eq!(pn, 0);
        let span = tx.data_mut(r);
        let last = span.len() - 1;
        span[last] = 0xAB;
        tx.commit()?;
    }
    {
        let mut tx = env.write_txn(false);
        let r = tx.get_page(0)?;
        assert_eq!(r.len as usize, 3 * 4096);
        assert_eq!(tx.data(r)[3 * 4096 - 1], 0xAB);
    }
    env.close()?;
    Ok(())
}
