//! crypto — ключевой материал и производные значения для per-page шифрования.
//!
//! Цели:
//! - MasterKey: 32 байта, zeroize в Drop.
//! - Субключ на страницу: derive_page_key(master, page_number) — ни одна пара
//!   страниц не делит ключевой материал (инвариант стора).
//! - Контентный хеш (SHA-256) буфера страницы для dirty-детекции на коммите.
//! - Загрузка ключа из hex/base64 (строка, файл, ENV).
//!
//! Примечания:
//! - Субключ = HMAC-SHA256(master, context8 || page_number_le), усечение до 32
//!   байт. PRF гарантирует уникальность по page_number при фиксированном ключе.
//! - Здесь нет шифрования страниц — см. page::aead.

use anyhow::{anyhow, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// 8-байтовый контекст деривации субключей страниц.
pub const KDF_CONTEXT: &[u8; 8] = b"VLPGKEY1";

pub const MASTER_KEY_LEN: usize = 32;
pub const PAGE_KEY_LEN: usize = 32;
pub const CONTENT_HASH_LEN: usize = 32;

/// 32-байтный мастер-ключ стора.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
}

// Безопасное обнуление: при уничтожении стираем секрет из памяти.
impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(anyhow!(
                "master key must be exactly {} bytes, got {}",
                MASTER_KEY_LEN,
                bytes.len()
            ));
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = decode_hex_trimmed(s)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim().as_bytes())
            .map_err(|e| anyhow!("base64 decode: {}", e))?;
        Self::from_bytes(&bytes)
    }

    /// Ключ из файла: сырые 32 байта, либо hex/base64 одной строкой.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| anyhow!("read master key file {}: {}", path.display(), e))?;
        if raw.len() == MASTER_KEY_LEN {
            return Self::from_bytes(&raw);
        }
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        Self::from_hex(text).or_else(|_| Self::from_base64(text))
    }

    /// Как from_env, но отсутствие переменных — не ошибка (cleartext-стор).
    pub fn from_env_opt() -> Result<Option<Self>> {
        if std::env::var("VL_MASTER_KEY_HEX").is_err()
            && std::env::var("VL_MASTER_KEY_BASE64").is_err()
        {
            return Ok(None);
        }
        Self::from_env().map(Some)
    }

    /// Ключ из ENV: VL_MASTER_KEY_HEX или VL_MASTER_KEY_BASE64.
    pub fn from_env() -> Result<Self> {
        if let Ok(hex) = std::env::var("VL_MASTER_KEY_HEX") {
            return Self::from_hex(&hex);
        }
        if let Ok(b64) = std::env::var("VL_MASTER_KEY_BASE64") {
            return Self::from_base64(&b64);
        }
        Err(anyhow!(
            "MasterKey::from_env: set VL_MASTER_KEY_HEX or VL_MASTER_KEY_BASE64"
        ))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.key
    }
}

/// Субключ для конкретной страницы: HMAC-SHA256(master, context || page_le).
/// Для page_number n1 != n2 результаты различны (PRF).
pub fn derive_page_key(master: &MasterKey, page_number: u64) -> [u8; PAGE_KEY_LEN] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(master.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(KDF_CONTEXT);
    mac.update(&page_number.to_le_bytes());
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; PAGE_KEY_LEN];
    key.copy_from_slice(&out);
    key
}

/// Контентный хеш буфера (SHA-256) для dirty-детекции.
pub fn content_hash(buf: &[u8]) -> [u8; CONTENT_HASH_LEN] {
    let mut h = Sha256::new();
    h.update(buf);
    let out = h.finalize();
    let mut digest = [0u8; CONTENT_HASH_LEN];
    digest.copy_from_slice(&out);
    digest
}

// ---------------------- helpers ----------------------

fn decode_hex_trimmed(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex key must have even length"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);
    for i in (0..bytes.len()).step_by(2) {
        let h = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i))?;
        let l = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i + 1))?;
        out.push(((h << 4) | l) as u8);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_keys_are_unique_per_page() {
        let mk = MasterKey::from_bytes(&[7u8; 32]).unwrap();
        let k0 = derive_page_key(&mk, 0);
        let k1 = derive_page_key(&mk, 1);
        let k_far = derive_page_key(&mk, u64::MAX - 1);
        assert_ne!(k0, k1);
        assert_ne!(k0, k_far);
        assert_ne!(k1, k_far);
        // Детерминированность
        assert_eq!(k0, derive_page_key(&mk, 0));
    }

    #[test]
    fn page_keys_depend_on_master() {
        let a = MasterKey::from_bytes(&[1u8; 32]).unwrap();
        let b = MasterKey::from_bytes(&[2u8; 32]).unwrap();
        assert_ne!(derive_page_key(&a, 5), derive_page_key(&b, 5));
    }

    #[test]
    fn hex_parsing() {
        let mk = MasterKey::from_hex(
            "1111111111111111111111111111111111111111111111111111111111111111",
        )
        .unwrap();
        assert_eq!(mk.as_bytes(), &[0x11u8; 32]);
        assert!(MasterKey::from_hex("zz").is_err());
        assert!(MasterKey::from_hex("11").is_err()); // слишком короткий
    }

    #[test]
    fn content_hash_detects_change() {
        let mut buf = vec![0u8; 256];
        let h0 = content_hash(&buf);
        buf[200] ^= 1;
        let h1 = content_hash(&buf);
        assert_ne!(h0, h1);
    }
}
