//! recovery/entities — парсеры raw-записей по типам таблиц.
//!
//! Контракт: парсер никогда не паникует; на мусорном входе — Ok(None) или
//! Err, и то и другое восстановимо для сканера (запись пропускается).
//! Форматы payload'ов — см. consts.rs и encode_* ниже (LE):
//! - документ/ревизия/конфликт:
//!   [etag u64][last_modified i64][id_len u16][cv_len u16][data_len u32]
//!   [id][change_vector][data(JSON)]
//! - группа счётчиков:
//!   [etag u64][last_modified i64][doc_id_len u16][n u16][reserved u32]
//!   [doc_id][n x (name_len u16, name, value i64)]

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::consts::{
    TABLE_TYPE_CONFLICTS, TABLE_TYPE_COUNTERS, TABLE_TYPE_DOCUMENTS, TABLE_TYPE_REVISIONS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Documents,
    Revisions,
    Conflicts,
    Counters,
}

impl TableType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            TABLE_TYPE_DOCUMENTS => Some(Self::Documents),
            TABLE_TYPE_REVISIONS => Some(Self::Revisions),
            TABLE_TYPE_CONFLICTS => Some(Self::Conflicts),
            TABLE_TYPE_COUNTERS => Some(Self::Counters),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Documents => TABLE_TYPE_DOCUMENTS,
            Self::Revisions => TABLE_TYPE_REVISIONS,
            Self::Conflicts => TABLE_TYPE_CONFLICTS,
            Self::Counters => TABLE_TYPE_COUNTERS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveredDocument {
    pub id: String,
    pub etag: u64,
    pub last_modified_ms: i64,
    pub change_vector: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveredCounterGroup {
    pub doc_id: String,
    pub etag: u64,
    pub last_modified_ms: i64,
    pub counters: Vec<(String, i64)>,
}

/// Тег, закодированный в терминальном chunk'е stream-цепочки.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentTag {
    pub doc_id: String,
    pub name: String,
    pub content_type: String,
}

// ---------- bounds-checked чтение ----------

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(anyhow!(
                "payload truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            ));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }
    fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }
    fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }
    fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }
    fn read_str(&mut self, n: usize) -> Result<String> {
        let s = self.take(n)?;
        String::from_utf8(s.to_vec()).map_err(|_| anyhow!("payload string is not UTF-8"))
    }
}

// ---------- парсеры ----------

fn parse_document_like(payload: &[u8]) -> Result<Option<RecoveredDocument>> {
    let mut r = PayloadReader::new(payload);
    let etag = r.read_u64()?;
    let last_modified_ms = r.read_i64()?;
    let id_len = r.read_u16()? as usize;
    let cv_len = r.read_u16()? as usize;
    let data_len = r.read_u32()? as usize;
    if id_len == 0 {
        return Ok(None); // документа без id не бывает
    }
    let id = r.read_str(id_len)?;
    let change_vector = r.read_str(cv_len)?;
    let data_bytes = r.take(data_len)?;
    // JSON-парс и есть структурная валидация содержимого
    let data: serde_json::Value = match serde_json::from_slice(data_bytes) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    Ok(Some(RecoveredDocument {
        id,
        etag,
        last_modified_ms,
        change_vector,
        data,
    }))
}

pub fn parse_document(payload: &[u8]) -> Result<Option<RecoveredDocument>> {
    parse_document_like(payload)
}

pub fn parse_revision(payload: &[u8]) -> Result<Option<RecoveredDocument>> {
    parse_document_like(payload)
}

pub fn parse_conflict(payload: &[u8]) -> Result<Option<RecoveredDocument>> {
    parse_document_like(payload)
}

pub fn parse_counter_group(payload: &[u8]) -> Result<Option<RecoveredCounterGroup>> {
    let mut r = PayloadReader::new(payload);
    let etag = r.read_u64()?;
    let last_modified_ms = r.read_i64()?;
    let doc_id_len = r.read_u16()? as usize;
    let n = r.read_u16()? as usize;
    let _reserved = r.read_u32()?;
    if doc_id_len == 0 {
        return Ok(None);
    }
    let doc_id = r.read_str(doc_id_len)?;
    let mut counters = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        let name_len = r.read_u16()? as usize;
        let name = r.read_str(name_len)?;
        let value = r.read_i64()?;
        counters.push((name, value));
    }
    Ok(Some(RecoveredCounterGroup {
        doc_id,
        etag,
        last_modified_ms,
        counters,
    }))
}

/// Тег в терминальном stream-chunk'е:
/// [tag_len u32][doc_id_len u16][doc_id][name_len u16][name][ct_len u16][ct].
/// tag_len == 0 — тега нет.
pub fn parse_attachment_tag(buf: &[u8]) -> Result<Option<AttachmentTag>> {
    let mut r = PayloadReader::new(buf);
    let tag_len = r.read_u32()? as usize;
    if tag_len == 0 {
        return Ok(None);
    }
    let doc_id_len = r.read_u16()? as usize;
    let doc_id = r.read_str(doc_id_len)?;
    let name_len = r.read_u16()? as usize;
    let name = r.read_str(name_len)?;
    let ct_len = r.read_u16()? as usize;
    let content_type = r.read_str(ct_len)?;
    Ok(Some(AttachmentTag {
        doc_id,
        name,
        content_type,
    }))
}

// ---------- кодирование (write entry points + тестовые фикстуры) ----------

pub fn encode_document_like(
    id: &str,
    etag: u64,
    last_modified_ms: i64,
    change_vector: &str,
    data_json: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(24 + id.len() + change_vector.len() + data_json.len());
    let mut tmp8 = [0u8; 8];
    LittleEndian::write_u64(&mut tmp8, etag);
    out.extend_from_slice(&tmp8);
    LittleEndian::write_i64(&mut tmp8, last_modified_ms);
    out.extend_from_slice(&tmp8);
    let mut tmp2 = [0u8; 2];
    LittleEndian::write_u16(&mut tmp2, id.len() as u16);
    out.extend_from_slice(&tmp2);
    LittleEndian::write_u16(&mut tmp2, change_vector.len() as u16);
    out.extend_from_slice(&tmp2);
    let mut tmp4 = [0u8; 4];
    LittleEndian::write_u32(&mut tmp4, data_json.len() as u32);
    out.extend_from_slice(&tmp4);
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(change_vector.as_bytes());
    out.extend_from_slice(data_json);
    out
}

pub fn encode_counter_group(
    doc_id: &str,
    etag: u64,
    last_modified_ms: i64,
    counters: &[(&str, i64)],
) -> Vec<u8> {
    let mut out = Vec::new();
    let mut tmp8 = [0u8; 8];
    LittleEndian::write_u64(&mut tmp8, etag);
    out.extend_from_slice(&tmp8);
    LittleEndian::write_i64(&mut tmp8, last_modified_ms);
    out.extend_from_slice(&tmp8);
    let mut tmp2 = [0u8; 2];
    LittleEndian::write_u16(&mut tmp2, doc_id.len() as u16);
    out.extend_from_slice(&tmp2);
    LittleEndian::write_u16(&mut tmp2, counters.len() as u16);
    out.extend_from_slice(&tmp2);
    out.extend_from_slice(&[0u8; 4]); // reserved
    out.extend_from_slice(doc_id.as_bytes());
    for (name, value) in counters {
        LittleEndian::write_u16(&mut tmp2, name.len() as u16);
        out.extend_from_slice(&tmp2);
        out.extend_from_slice(name.as_bytes());
        LittleEndian::write_i64(&mut tmp8, *value);
        out.extend_from_slice(&tmp8);
    }
    out
}

pub fn encode_attachment_tag(tag: &AttachmentTag) -> Vec<u8> {
    let body_len = 2 + tag.doc_id.len() + 2 + tag.name.len() + 2 + tag.content_type.len();
    let mut out = Vec::with_capacity(4 + body_len);
    let mut tmp4 = [0u8; 4];
    LittleEndian::write_u32(&mut tmp4, body_len as u32);
    out.extend_from_slice(&tmp4);
    let mut tmp2 = [0u8; 2];
    for (len, bytes) in [
        (tag.doc_id.len(), tag.doc_id.as_bytes()),
        (tag.name.len(), tag.name.as_bytes()),
        (tag.content_type.len(), tag.content_type.as_bytes()),
    ] {
        LittleEndian::write_u16(&mut tmp2, len as u16);
        out.extend_from_slice(&tmp2);
        out.extend_from_slice(bytes);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_roundtrip() {
        let payload = encode_document_like(
            "users/1",
            42,
            1_700_000_000_000,
            "A:42",
            br#"{"name":"ada"}"#,
        );
        let doc = parse_document(&payload).unwrap().unwrap();
        assert_eq!(doc.id, "users/1");
        assert_eq!(doc.etag, 42);
        assert_eq!(doc.change_vector, "A:42");
        assert_eq!(doc.data["name"], "ada");
    }

    #[test]
    fn truncated_payload_is_recoverable() {
        let payload = encode_document_like("users/1", 1, 0, "A:1", b"{}");
        // Обрубок на середине id
        assert!(parse_document(&payload[..20]).is_err());
        // Пустой вход
        assert!(parse_document(&[]).is_err());
    }

    #[test]
    fn garbage_json_gives_none_not_err() {
        let payload = encode_document_like("users/1", 1, 0, "A:1", b"not json at all");
        assert!(parse_document(&payload).unwrap().is_none());
    }

    #[test]
    fn empty_id_gives_none() {
        let payload = encode_document_like("", 1, 0, "A:1", b"{}");
        assert!(parse_document(&payload).unwrap().is_none());
    }

    #[test]
    fn counter_group_roundtrip() {
        let payload = encode_counter_group(
            "users/1",
            7,
            1000,
            &[("likes", 12), ("downloads", -3)],
        );
        let g = parse_counter_group(&payload).unwrap().unwrap();
        assert_eq!(g.doc_id, "users/1");
        assert_eq!(g.counters.len(), 2);
        assert_eq!(g.counters[1], ("downloads".to_string(), -3));
    }

    #[test]
    fn counter_count_beyond_payload_is_err() {
        let mut payload = encode_counter_group("users/1", 7, 1000, &[("likes", 12)]);
        // Завышаем n, не добавляя данных
        payload[18] = 200;
        assert!(parse_counter_group(&payload).is_err());
    }

    #[test]
    fn attachment_tag_roundtrip() {
        let tag = AttachmentTag {
            doc_id: "users/1".into(),
            name: "avatar.png".into(),
            content_type: "image/png".into(),
        };
        let bytes = encode_attachment_tag(&tag);
        assert_eq!(parse_attachment_tag(&bytes).unwrap().unwrap(), tag);
        // Нулевой tag_len — тега нет
        assert!(parse_attachment_tag(&[0, 0, 0, 0]).unwrap().is_none());
    }

    #[test]
    fn table_type_dispatch() {
        assert_eq!(TableType::from_u8(1), Some(TableType::Documents));
        assert_eq!(TableType::from_u8(4), Some(TableType::Counters));
        assert_eq!(TableType::from_u8(0), None);
        assert_eq!(TableType::from_u8(99), None);
    }
}
