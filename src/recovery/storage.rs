//! recovery/storage — приёмник восстановленных сущностей.
//!
//! RecoverySink пишет свежий выходной стор:
//! - documents.jsonl   — документы (LWW по etag, победители выгружаются в
//!   finalize из spill-файла; в памяти живёт только индекс id -> etag);
//! - revisions.jsonl, conflicts.jsonl, counters.jsonl — поточно, батчами;
//! - attachments/<hash> — content-addressed тела вложений;
//! - attachments.jsonl — метаданные вложений (hash, size, tag);
//! - orphans.jsonl     — сущности без родителя (политика preserve).
//!
//! Батчи: поточные записи (тела документов включительно) копятся в памяти и
//! «пульсируются» (flush + fsync), когда накопленный объём превышает порог —
//! единственный механизм backpressure длинного скана.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::entities::{AttachmentTag, RecoveredCounterGroup, RecoveredDocument};

/// Порог «пульса» батча (байт в памяти до принудительного flush+fsync).
const BATCH_PULSE_BYTES: usize = 1 << 20;

/// Spill-файл с телами документов до LWW-разбора; удаляется в finalize.
const DOC_SPILL_FILE: &str = ".documents.spill.jsonl";

/// Политика для сущностей без родителя.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Сохранять под синтетическими orphan-коллекциями (по умолчанию).
    Preserve,
    Discard,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentMeta {
    pub hash: String,
    pub size: u64,
    pub tag: Option<AttachmentTag>,
}

/// Интерфейс приёмника; сканер знает только его.
pub trait RecoveryStorage {
    fn put_document(&mut self, doc: RecoveredDocument) -> Result<()>;
    fn put_revision(&mut self, rev: RecoveredDocument) -> Result<()>;
    fn put_conflict(&mut self, conflict: RecoveredDocument) -> Result<()>;
    fn put_counter_group(&mut self, group: RecoveredCounterGroup) -> Result<()>;
    /// body — временный файл с собранными chunk'ами; hash — hex SHA-256.
    fn put_attachment(
        &mut self,
        body: &Path,
        hash: &str,
        size: u64,
        tag: Option<AttachmentTag>,
    ) -> Result<()>;
    /// Etag восстановленного документа с таким id (тела живут на диске).
    fn get(&self, id: &str) -> Option<u64>;
    fn attachment_exists(&self, hash: &str) -> bool;
    fn handle_orphans(&mut self) -> Result<()>;
    fn finalize(&mut self) -> Result<()>;
}

// ---------- JSONL-писатель с батчингом ----------

struct JsonlWriter {
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
}

impl JsonlWriter {
    fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            path,
            file,
            pending: Vec::new(),
        })
    }

    fn append<T: Serialize>(&mut self, value: &T) -> Result<usize> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let n = line.len();
        self.pending.extend_from_slice(&line);
        Ok(n)
    }

    fn flush_sync(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.file
                .write_all(&self.pending)
                .with_context(|| format!("write {}", self.path.display()))?;
            self.file.sync_all()?;
            self.pending.clear();
        }
        Ok(())
    }
}

// ---------- Приёмник ----------

/// Победитель LWW по id: etag и порядковый номер записи в spill-файле.
#[derive(Debug, Clone, Copy)]
struct DocSlot {
    etag: u64,
    seq: u64,
}

/// Строка spill-файла документов.
#[derive(Serialize, Deserialize)]
struct DocSpillRecord {
    seq: u64,
    doc: RecoveredDocument,
}

pub struct RecoverySink {
    out_dir: PathBuf,
    attachments_dir: PathBuf,
    policy: OrphanPolicy,

    doc_index: BTreeMap<String, DocSlot>,
    doc_spill: JsonlWriter,
    doc_seq: u64,
    revisions: JsonlWriter,
    conflicts: JsonlWriter,
    counters: JsonlWriter,
    attachments: JsonlWriter,

    // для handle_orphans
    attachment_meta: Vec<AttachmentMeta>,
    revision_doc_ids: Vec<String>,
    counter_doc_ids: Vec<String>,

    pending_bytes: usize,
    pub duplicates_discarded: u64,
    pub orphans_preserved: u64,
    pub orphans_discarded: u64,
    finalized: bool,
}

impl RecoverySink {
    /// Создать свежий выходной стор. Каталог должен быть пуст или отсутствовать.
    pub fn create(out_dir: &Path, policy: OrphanPolicy) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("create output dir {}", out_dir.display()))?;
        if fs::read_dir(out_dir)?.next().is_some() {
            return Err(anyhow!(
                "output dir {} is not empty, refusing to overwrite",
                out_dir.display()
            ));
        }
        let attachments_dir = out_dir.join("attachments");
        fs::create_dir_all(&attachments_dir)?;
        info!("recovery sink: fresh store at {}", out_dir.display());
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            attachments_dir,
            policy,
            doc_index: BTreeMap::new(),
            doc_spill: JsonlWriter::create(out_dir.join(DOC_SPILL_FILE))?,
            doc_seq: 0,
            revisions: JsonlWriter::create(out_dir.join("revisions.jsonl"))?,
            conflicts: JsonlWriter::create(out_dir.join("conflicts.jsonl"))?,
            counters: JsonlWriter::create(out_dir.join("counters.jsonl"))?,
            attachments: JsonlWriter::create(out_dir.join("attachments.jsonl"))?,
            attachment_meta: Vec::new(),
            revision_doc_ids: Vec::new(),
            counter_doc_ids: Vec::new(),
            pending_bytes: 0,
            duplicates_discarded: 0,
            orphans_preserved: 0,
            orphans_discarded: 0,
            finalized: false,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn document_count(&self) -> usize {
        self.doc_index.len()
    }

    fn maybe_pulse(&mut self) -> Result<()> {
        if self.pending_bytes >= BATCH_PULSE_BYTES {
            debug!("recovery sink: pulse ({} pending bytes)", self.pending_bytes);
            self.doc_spill.flush_sync()?;
            self.revisions.flush_sync()?;
            self.conflicts.flush_sync()?;
            self.counters.flush_sync()?;
            self.attachments.flush_sync()?;
            self.pending_bytes = 0;
        }
        Ok(())
    }

    fn attachment_path(&self, hash: &str) -> PathBuf {
        self.attachments_dir.join(hash)
    }
}

impl RecoveryStorage for RecoverySink {
    /// Тело сразу уходит в spill-файл (через общий пульс), в памяти остаётся
    /// только слот-победитель id -> (etag, seq).
    fn put_document(&mut self, doc: RecoveredDocument) -> Result<()> {
        let seq = self.doc_seq;
        self.doc_seq += 1;
        match self.doc_index.get(&doc.id) {
            Some(slot) if slot.etag >= doc.etag => {
                // LWW: старый etag проигрывает молча
                self.duplicates_discarded += 1;
                debug!(
                    "recovery sink: duplicate {} (etag {} <= {}), discarded",
                    doc.id, doc.etag, slot.etag
                );
            }
            Some(_) => {
                self.duplicates_discarded += 1;
                self.doc_index
                    .insert(doc.id.clone(), DocSlot { etag: doc.etag, seq });
            }
            None => {
                self.doc_index
                    .insert(doc.id.clone(), DocSlot { etag: doc.etag, seq });
            }
        }
        self.pending_bytes += self.doc_spill.append(&DocSpillRecord { seq, doc })?;
        self.maybe_pulse()
    }

    fn put_revision(&mut self, rev: RecoveredDocument) -> Result<()> {
        self.revision_doc_ids.push(rev.id.clone());
        self.pending_bytes += self.revisions.append(&rev)?;
        self.maybe_pulse()
    }

    fn put_conflict(&mut self, conflict: RecoveredDocument) -> Result<()> {
        self.pending_bytes += self.conflicts.append(&conflict)?;
        self.maybe_pulse()
    }

    fn put_counter_group(&mut self, group: RecoveredCounterGroup) -> Result<()> {
        self.counter_doc_ids.push(group.doc_id.clone());
        self.pending_bytes += self.counters.append(&group)?;
        self.maybe_pulse()
    }

    fn put_attachment(
        &mut self,
        body: &Path,
        hash: &str,
        size: u64,
        tag: Option<AttachmentTag>,
    ) -> Result<()> {
        let dst = self.attachment_path(hash);
        if dst.exists() {
            // content-addressed: дубликат по hash бесплатен
            debug!("recovery sink: attachment {} already stored", hash);
        } else {
            fs::copy(body, &dst)
                .with_context(|| format!("store attachment {}", dst.display()))?;
            File::open(&dst)?.sync_all()?;
        }
        let meta = AttachmentMeta {
            hash: hash.to_string(),
            size,
            tag,
        };
        self.pending_bytes += self.attachments.append(&meta)?;
        self.attachment_meta.push(meta);
        self.maybe_pulse()
    }

    fn get(&self, id: &str) -> Option<u64> {
        self.doc_index.get(id).map(|slot| slot.etag)
    }

    fn attachment_exists(&self, hash: &str) -> bool {
        self.attachment_path(hash).exists()
    }

    /// Разобраться с сущностями без родителя: вложения, чей doc_id не
    /// восстановлен (или без тега), и ревизии/счётчики несуществующих
    /// документов.
    fn handle_orphans(&mut self) -> Result<()> {
        let mut orphans = JsonlWriter::create(self.out_dir.join("orphans.jsonl"))?;

        for meta in &self.attachment_meta {
            let parent_known = meta
                .tag
                .as_ref()
                .map(|t| self.doc_index.contains_key(&t.doc_id))
                .unwrap_or(false);
            if parent_known {
                continue;
            }
            match self.policy {
                OrphanPolicy::Preserve => {
                    orphans.append(&serde_json::json!({
                        "kind": "attachment",
                        "hash": meta.hash,
                        "size": meta.size,
                        "tag": meta.tag,
                    }))?;
                    self.orphans_preserved += 1;
                }
                OrphanPolicy::Discard => {
                    let path = self.attachments_dir.join(&meta.hash);
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                    self.orphans_discarded += 1;
                }
            }
        }

        for id in self.revision_doc_ids.iter().chain(&self.counter_doc_ids) {
            if self.doc_index.contains_key(id) {
                continue;
            }
            match self.policy {
                OrphanPolicy::Preserve => {
                    orphans.append(&serde_json::json!({
                        "kind": "parentless",
                        "doc_id": id,
                    }))?;
                    self.orphans_preserved += 1;
                }
                OrphanPolicy::Discard => {
                    self.orphans_discarded += 1;
                }
            }
        }

        orphans.flush_sync()?;
        if self.orphans_preserved + self.orphans_discarded > 0 {
            warn!(
                "recovery sink: {} orphan(s) preserved, {} discarded",
                self.orphans_preserved, self.orphans_discarded
            );
        }
        Ok(())
    }

    /// LWW-разбор spill-файла в documents.jsonl и добивка всех батчей.
    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.doc_spill.flush_sync()?;

        let spill_path = self.out_dir.join(DOC_SPILL_FILE);
        let mut docs = JsonlWriter::create(self.out_dir.join("documents.jsonl"))?;
        let spill = BufReader::new(
            File::open(&spill_path)
                .with_context(|| format!("open {}", spill_path.display()))?,
        );
        for line in spill.lines() {
            let line = line?;
            let rec: DocSpillRecord = serde_json::from_str(&line)
                .with_context(|| format!("parse {}", spill_path.display()))?;
            let winner = self
                .doc_index
                .get(&rec.doc.id)
                .map(|slot| slot.seq == rec.seq)
                .unwrap_or(false);
            if winner {
                docs.append(&rec.doc)?;
            }
        }
        docs.flush_sync()?;
        fs::remove_file(&spill_path).ok();

        self.revisions.flush_sync()?;
        self.conflicts.flush_sync()?;
        self.counters.flush_sync()?;
        self.attachments.flush_sync()?;
        self.pending_bytes = 0;
        self.finalized = true;
        info!(
            "recovery sink: finalized ({} document(s))",
            self.doc_index.len()
        );
        Ok(())
    }
}
