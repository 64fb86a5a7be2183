use anyhow::Result;
use oorandom::Rand64;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use VellumDB::consts::PAGE_HDR_SIZE;
use VellumDB::crypto::MasterKey;
use VellumDB::page::raw_data_flags;
use VellumDB::{Env, EnvOptions};

const PS: usize = 4096;
const PAGES: u64 = 16;
const ROUNDS: usize = 200;

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("vldb-{}-{}-{}", prefix, pid, t))
}

#[test]
fn random_churn_survives_reopen() -> Result<()> {
    let root = unique_root("stress-churn");
    let mk = Arc::new(MasterKey::from_bytes(&[0x42u8; 32])?);
    let opts = EnvOptions {
        page_size: PS as u32,
        master_key: Some(Arc::clone(&mk)),
        ..EnvOptions::default()
    };

    // Теневая модель payload'ов по страницам
    let mut model: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut rng = Rand64::new(0xC0FFEE);

    let env = Env::create(&root, &opts)?;
    {
        let mut tx = env.write_txn(false);
        for i in 0..PAGES {
            let (pn, _) = tx.allocate_page(1, raw_data_flags(false))?;
            assert_eq!(pn, i);
            model.insert(pn, vec![0u8; PS - PAGE_HDR_SIZE]);
        }
        tx.commit()?;
    }

    for _ in 0..ROUNDS {
        let pn = rng.rand_range(0..PAGES);
        let off = rng.rand_range(0..(PS - PAGE_HDR_SIZE - 32) as u64) as usize;
        let byte = (rng.rand_u64() & 0xFF) as u8;

        let mut tx = env.write_txn(false);
        let r = tx.modify_page(pn)?;
        for j in 0..32 {
            tx.data_mut(r)[PAGE_HDR_SIZE + off + j] = byte.wrapping_add(j as u8);
        }
        tx.commit()?;

        let shadow = model.get_mut(&pn).unwrap();
        for j in 0..32 {
            shadow[off + j] = byte.wrapping_add(j as u8);
        }
    }
    env.close()?;

    // После переоткрытия каждая страница совпадает с моделью
    let env = Env::open(&root, &opts)?;
    let mut tx = env.write_txn(false);
    for pn in 0..PAGES {
        let r = tx.get_page(pn)?;
        assert_eq!(
            &tx.data(r)[PAGE_HDR_SIZE..],
            model[&pn].as_slice(),
            "page {} diverged from the model",
            pn
        );
    }
    drop(tx);
    env.close()?;
    Ok(())
}

#[test]
fn interleaved_rollbacks_do_not_leak_into_state() -> Result<()> {
    let root = unique_root("stress-rb");
    let opts = EnvOptions {
        page_size: PS as u32,
        ..EnvOptions::default()
    };
    let env = Env::create(&root, &opts)?;
    {
        let mut tx = env.write_txn(false);
        let (pn, r) = tx.allocate_page(1, raw_data_flags(false))?;
        assert_eq!(pn, 0);
        tx.data_mut(r)[PAGE_HDR_SIZE] = 0x11;
        tx.commit()?;
    }

    let mut rng = Rand64::new(7);
    for _ in 0..50 {
        let mut tx = env.write_txn(false);
        let r = tx.modify_page(0)?;
        tx.data_mut(r)[PAGE_HDR_SIZE] = (rng.rand_u64() & 0xFF) as u8;
        tx.rollback();

        let mut tx = env.write_txn(false);
        let r = tx.get_page(0)?;
        assert_eq!(tx.data(r)[PAGE_HDR_SIZE], 0x11);
    }
    env.close()?;
    Ok(())
}
