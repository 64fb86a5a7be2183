use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use VellumDB::consts::{
    DATA_FILE, NO_PAGE, PAGE_HDR_SIZE, RAW_ENTRY_HDR_SIZE, RAW_ENTRY_OFF_TABLE_TYPE,
    RAW_ENTRY_OFF_USED, RAW_SMALL_HDR_END, RAW_SMALL_OFF_NEXT_ALLOCATION, RAW_SMALL_OFF_NUM_ENTRIES,
    STREAM_DATA_START, STREAM_FLAG_FIRST, STREAM_OFF_CHUNK_SIZE, STREAM_OFF_FLAGS,
    STREAM_OFF_NEXT_PAGE, TABLE_TYPE_DOCUMENTS,
};
use VellumDB::page::{
    page_header_write, page_update_checksum, raw_data_flags, stream_page_flags, PageHeader,
};
use VellumDB::recovery::entities::{encode_attachment_tag, encode_document_like, AttachmentTag};
use VellumDB::recovery::{Recovery, RecoveryConfig, RecoveryOutcome};
use VellumDB::util::to_hex;

const PS: usize = 4096;

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("vldb-{}-{}-{}", prefix, pid, t))
}

/// Stream-страница: chunk данных и ссылка на следующее звено.
fn stream_page(page_number: u64, chunk: &[u8], next: u64, first: bool) -> Vec<u8> {
    let mut span = vec![0u8; PS];
    page_header_write(
        &mut span,
        &PageHeader {
            page_number,
            flags: stream_page_flags(),
            overflow_size: (PS - PAGE_HDR_SIZE) as u32,
        },
    )
    .unwrap();
    LittleEndian::write_u64(
        &mut span[STREAM_OFF_CHUNK_SIZE..STREAM_OFF_CHUNK_SIZE + 8],
        chunk.len() as u64,
    );
    LittleEndian::write_u64(&mut span[STREAM_OFF_NEXT_PAGE..STREAM_OFF_NEXT_PAGE + 8], next);
    LittleEndian::write_u32(
        &mut span[STREAM_OFF_FLAGS..STREAM_OFF_FLAGS + 4],
        if first { STREAM_FLAG_FIRST } else { 0 },
    );
    span[STREAM_DATA_START..STREAM_DATA_START + chunk.len()].copy_from_slice(chunk);
    page_update_checksum(&mut span).unwrap();
    span
}

/// Терминальное звено: chunk_size == 0, опциональный тег.
fn stream_terminal(page_number: u64, tag: Option<&AttachmentTag>) -> Vec<u8> {
    let mut span = vec![0u8; PS];
    page_header_write(
        &mut span,
        &PageHeader {
            page_number,
            flags: stream_page_flags(),
            overflow_size: (PS - PAGE_HDR_SIZE) as u32,
        },
    )
    .unwrap();
    LittleEndian::write_u64(&mut span[STREAM_OFF_NEXT_PAGE..STREAM_OFF_NEXT_PAGE + 8], NO_PAGE);
    if let Some(t) = tag {
        let bytes = encode_attachment_tag(t);
        span[STREAM_DATA_START..STREAM_DATA_START + bytes.len()].copy_from_slice(&bytes);
    }
    page_update_checksum(&mut span).unwrap();
    span
}

fn doc_page(page_number: u64, id: &str) -> Vec<u8> {
    let payload = encode_document_like(id, 1, 0, "A:1", b"{}");
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
    let off = RAW_SMALL_HDR_END;
    LittleEndian::write_u16(&mut span[off..off + 2], payload.len() as u16);
    LittleEndian::write_u16(
        &mut span[off + RAW_ENTRY_OFF_USED..off + RAW_ENTRY_OFF_USED + 2],
        payload.len() as u16,
    );
    span[off + RAW_ENTRY_OFF_TABLE_TYPE] = TABLE_TYPE_DOCUMENTS;
    span[off + RAW_ENTRY_HDR_SIZE..off + RAW_ENTRY_HDR_SIZE + payload.len()]
        .copy_from_slice(&payload);
    LittleEndian::write_u16(
        &mut span[RAW_SMALL_OFF_NEXT_ALLOCATION..RAW_SMALL_OFF_NEXT_ALLOCATION + 2],
        (off + RAW_ENTRY_HDR_SIZE + payload.len()) as u16,
    );
    LittleEndian::write_u16(&mut span[RAW_SMALL_OFF_NUM_ENTRIES..RAW_SMALL_OFF_NUM_ENTRIES + 2], 1);
    page_update_checksum(&mut span).unwrap();
    span
}

fn run(root: &PathBuf, out: &PathBuf, discard_orphans: bool) -> Result<(RecoveryOutcome, VellumDB::ExecutionStatus)> {
    Recovery::new(RecoveryConfig {
        data_dir: root.clone(),
        output_dir: out.clone(),
        page_size: Some(PS as u32),
        master_key: None,
        progress_interval: Duration::from_secs(60),
        ignore_invalid_journal: false,
        copy_on_write: true,
        discard_orphans,
    })?
    .run(&AtomicBool::new(false))
}

#[test]
fn multi_chunk_attachment_is_reassembled() -> Result<()> {
    let root = unique_root("stream-multi");
    fs::create_dir_all(&root)?;

    let chunk_a: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let chunk_b: Vec<u8> = (0..1500u32).map(|i| (i % 13) as u8).collect();
    let tag = AttachmentTag {
        doc_id: "users/1".into(),
        name: "avatar.png".into(),
        content_type: "image/png".into(),
    };

    let mut data = Vec::new();
    data.extend_from_slice(&stream_page(0, &chunk_a, 1, true));
    data.extend_from_slice(&stream_page(1, &chunk_b, 2, false));
    data.extend_from_slice(&stream_terminal(2, Some(&tag)));
    data.extend_from_slice(&doc_page(3, "users/1"));
    fs::write(root.join(DATA_FILE), &data)?;

    let out = unique_root("stream-multi-out");
    let (outcome, status) = run(&root, &out, false)?;
    assert_eq!(outcome, RecoveryOutcome::Success);
    assert_eq!(status.attachments, 1);
    assert_eq!(status.documents, 1);
    assert_eq!(status.faulted_pages, 0);
    // Звенья 1 и 2 пропущены линейным проходом без fault'а
    assert_eq!(status.skipped_pages, 2);
    // Родитель известен — сирот нет
    assert_eq!(status.orphans_preserved, 0);

    // Тело вложения собрано байт-в-байт, имя — SHA-256 содержимого
    let mut h = Sha256::new();
    h.update(&chunk_a);
    h.update(&chunk_b);
    let hash = to_hex(&h.finalize());
    let body = fs::read(out.join("attachments").join(&hash))?;
    assert_eq!(body.len(), chunk_a.len() + chunk_b.len());
    assert_eq!(&body[..chunk_a.len()], &chunk_a[..]);
    assert_eq!(&body[chunk_a.len()..], &chunk_b[..]);

    let meta = fs::read_to_string(out.join("attachments.jsonl"))?;
    assert!(meta.contains(&hash));
    assert!(meta.contains("avatar.png"));
    Ok(())
}

#[test]
fn identical_chains_share_one_body() -> Result<()> {
    let root = unique_root("stream-dedupe");
    fs::create_dir_all(&root)?;

    let chunk: Vec<u8> = vec![0x5A; 1000];
    let tag = AttachmentTag {
        doc_id: "users/1".into(),
        name: "copy.bin".into(),
        content_type: "application/octet-stream".into(),
    };

    let mut data = Vec::new();
    data.extend_from_slice(&stream_page(0, &chunk, 1, true));
    data.extend_from_slice(&stream_terminal(1, Some(&tag)));
    data.extend_from_slice(&stream_page(2, &chunk, 3, true));
    data.extend_from_slice(&stream_terminal(3, Some(&tag)));
    data.extend_from_slice(&doc_page(4, "users/1"));
    fs::write(root.join(DATA_FILE), &data)?;

    let out = unique_root("stream-dedupe-out");
    let (_, status) = run(&root, &out, false)?;
    assert_eq!(status.attachments, 2);

    // Content-addressed: два вложения, одно тело
    let bodies: Vec<_> = fs::read_dir(out.join("attachments"))?.collect();
    assert_eq!(bodies.len(), 1);
    assert_eq!(fs::read_to_string(out.join("attachments.jsonl"))?.lines().count(), 2);
    Ok(())
}

#[test]
fn broken_chain_is_a_fault_not_abort() -> Result<()> {
    let root = unique_root("stream-broken");
    fs::create_dir_all(&root)?;

    let chunk = vec![1u8; 100];
    let mut data = Vec::new();
    // next указывает за пределы файла
    data.extend_from_slice(&stream_page(0, &chunk, 50, true));
    data.extend_from_slice(&doc_page(1, "users/after"));
    fs::write(root.join(DATA_FILE), &data)?;

    let out = unique_root("stream-broken-out");
    let (outcome, status) = run(&root, &out, false)?;
    assert_eq!(outcome, RecoveryOutcome::Success);
    assert_eq!(status.faulted_pages, 1);
    assert_eq!(status.attachments, 0);
    // Скан продолжился после оборванной цепочки
    assert_eq!(status.documents, 1);
    Ok(())
}

#[test]
fn orphan_attachment_policy() -> Result<()> {
    // Цепочка без восстановленного родителя
    let build = |root: &PathBuf| -> Result<()> {
        fs::create_dir_all(root)?;
        let chunk = vec![7u8; 64];
        let tag = AttachmentTag {
            doc_id: "users/missing".into(),
            name: "lost.bin".into(),
            content_type: "application/octet-stream".into(),
        };
        let mut data = Vec::new();
        data.extend_from_slice(&stream_page(0, &chunk, 1, true));
        data.extend_from_slice(&stream_terminal(1, Some(&tag)));
        fs::write(root.join(DATA_FILE), &data)?;
        Ok(())
    };

    // preserve: тело остаётся, сирота задокументирована
    let root = unique_root("stream-orphan-p");
    build(&root)?;
    let out = unique_root("stream-orphan-p-out");
    let (_, status) = run(&root, &out, false)?;
    assert_eq!(status.orphans_preserved, 1);
    let orphans = fs::read_to_string(out.join("orphans.jsonl"))?;
    assert!(orphans.contains("attachment"));
    assert_eq!(fs::read_dir(out.join("attachments"))?.count(), 1);

    // discard: тело удаляется
    let root2 = unique_root("stream-orphan-d");
    build(&root2)?;
    let out2 = unique_root("stream-orphan-d-out");
    let (_, status2) = run(&root2, &out2, true)?;
    assert_eq!(status2.orphans_discarded, 1);
    assert_eq!(fs::read_dir(out2.join("attachments"))?.count(), 0);
    Ok(())
}
