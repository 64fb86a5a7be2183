use anyhow::Result;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use VellumDB::consts::{PAGE_HDR_SIZE, WAL_HDR_SIZE, WAL_REC_BEGIN, WAL_REC_PAGE_IMAGE};
use VellumDB::journal::{journal_path, write_record, Journal};
use VellumDB::page::{page_header_write, page_update_checksum, raw_data_flags, PageHeader};
use VellumDB::pager::PageImage;
use VellumDB::{read_meta, set_clean_shutdown, Env, EnvOptions};

const PS: usize = 4096;

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("vldb-{}-{}-{}", prefix, pid, t))
}

fn opts() -> EnvOptions {
    EnvOptions {
        page_size: PS as u32,
        ..EnvOptions::default()
    }
}

/// Валидный cleartext-лист с маркером в начале payload'а.
fn page_with_marker(page_number: u64, marker: &[u8]) -> Vec<u8> {
    let mut span = vec![0u8; PS];
    page_header_write(
        &mut span,
        &PageHeader {
            page_number,
            flags: raw_data_flags(false),
            overflow_size: 0,
        },
    )
    .unwrap();
    span[PAGE_HDR_SIZE..PAGE_HDR_SIZE + marker.len()].copy_from_slice(marker);
    page_update_checksum(&mut span).unwrap();
    span
}

fn read_marker(env: &Env, page_number: u64, len: usize) -> Result<Vec<u8>> {
    let mut tx = env.write_txn(false);
    let r = tx.get_page(page_number)?;
    Ok(tx.data(r)[PAGE_HDR_SIZE..PAGE_HDR_SIZE + len].to_vec())
}

#[test]
fn committed_batch_is_replayed_after_crash() -> Result<()> {
    let root = unique_root("replay-commit");

    // Обычная жизнь: страница v1 через транзакцию
    {
        let env = Env::create(&root, &opts())?;
        let mut tx = env.write_txn(false);
        let (pn, r) = tx.allocate_page(1, raw_data_flags(false))?;
        assert_eq!(pn, 0);
        tx.data_mut(r)[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 2].copy_from_slice(b"v1");
        tx.commit()?;
        env.close()?;
    }

    // «Крэш»: батч v2 дошёл до журнала, но не до data-файла
    {
        let mut journal = Journal::open_for_append(&root)?;
        journal.append_batch(
            100,
            &[PageImage {
                page_number: 0,
                bytes: page_with_marker(0, b"v2"),
            }],
        )?;
    }
    set_clean_shutdown(&root, false)?;

    // Реплей при открытии применяет закоммиченный батч
    {
        let env = Env::open(&root, &opts())?;
        assert_eq!(read_marker(&env, 0, 2)?, b"v2");
        env.close()?;
    }
    // last_lsn дотянут до lsn реплея
    assert_eq!(read_meta(&root)?.last_lsn, 100);
    Ok(())
}

#[test]
fn uncommitted_batch_and_partial_tail_are_dropped() -> Result<()> {
    let root = unique_root("replay-uncommitted");

    {
        let env = Env::create(&root, &opts())?;
        let mut tx = env.write_txn(false);
        let (_, r) = tx.allocate_page(1, raw_data_flags(false))?;
        tx.data_mut(r)[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 2].copy_from_slice(b"v1");
        tx.commit()?;
        env.close()?;
    }

    // BEGIN + PAGE_IMAGE без COMMIT, затем рваный хвост
    {
        let path = journal_path(&root);
        let mut f = OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::End(0))?;
        write_record(&mut f, WAL_REC_BEGIN, 200, 0, &[])?;
        write_record(
            &mut f,
            WAL_REC_PAGE_IMAGE,
            200,
            0,
            &page_with_marker(0, b"v3"),
        )?;
        f.write_all(&[0xFF; 10])?; // обрубок следующего заголовка
        f.sync_all()?;
    }
    set_clean_shutdown(&root, false)?;

    // Незакоммиченное не применяется, рваный хвост — нормальный конец файла
    {
        let env = Env::open(&root, &opts())?;
        assert_eq!(read_marker(&env, 0, 2)?, b"v1");
        env.close()?;
    }
    Ok(())
}

#[test]
fn clean_shutdown_skips_replay() -> Result<()> {
    let root = unique_root("replay-clean");

    {
        let env = Env::create(&root, &opts())?;
        let mut tx = env.write_txn(false);
        let (_, r) = tx.allocate_page(1, raw_data_flags(false))?;
        tx.data_mut(r)[PAGE_HDR_SIZE..PAGE_HDR_SIZE + 2].copy_from_slice(b"v1");
        tx.commit()?;
        env.close()?;
    }

    // Батч в журнале есть, но clean_shutdown = true: образы уже на месте,
    // повторное применение не нужно
    {
        let mut journal = Journal::open_for_append(&root)?;
        journal.append_batch(
            300,
            &[PageImage {
                page_number: 0,
                bytes: page_with_marker(0, b"v9"),
            }],
        )?;
    }

    {
        let env = Env::open(&root, &opts())?;
        assert_eq!(read_marker(&env, 0, 2)?, b"v1");
        env.close()?;
    }
    Ok(())
}

#[test]
fn replay_truncates_journal_to_header() -> Result<()> {
    let root = unique_root("replay-trunc");

    {
        let env = Env::create(&root, &opts())?;
        let mut tx = env.write_txn(false);
        let (_, r) = tx.allocate_page(1, raw_data_flags(false))?;
        tx.data_mut(r)[PAGE_HDR_SIZE] = 7;
        tx.commit()?;
        env.close()?;
    }
    set_clean_shutdown(&root, false)?;

    {
        let env = Env::open(&root, &opts())?;
        env.close()?;
    }
    // После открытия журнал усечён до заголовка файла
    let len = std::fs::metadata(journal_path(&root))?.len();
    assert_eq!(len, WAL_HDR_SIZE as u64);
    Ok(())
}
