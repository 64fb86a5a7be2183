//! page/aead — per-page шифрование (XChaCha20-Poly1305, detached tag).
//!
//! Раскладка в заголовке:
//! - nonce[16] в [24..40), случайный на каждое шифрование;
//! - полный 192-битный AEAD-nonce = [16..40): 8 байт поля checksum расширяют
//!   128-битное поле до требуемых 24 байт. Ведущие байты не случайны, но
//!   хвостовые 128 бит случайны на каждый вызов — при уникальном per-page
//!   ключе этого достаточно для уникальности nonce;
//! - tag[16] в [40..56);
//! - AAD = заголовок [0..16) (page_number, flags, overflow_size);
//! - шифруется payload [64..span).
//!
//! Ключ — всегда субключ конкретной страницы (crypto::derive_page_key):
//! две разные страницы никогда не делят ключевой материал.

use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Key, Tag, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::consts::{
    AEAD_AAD_LEN, FULL_NONCE_OFF, FULL_NONCE_SIZE, MAC_SIZE, NONCE_SIZE, OFF_MAC, OFF_NONCE,
    PAGE_HDR_SIZE,
};

#[inline]
fn full_nonce(span: &[u8]) -> [u8; FULL_NONCE_SIZE] {
    let mut n = [0u8; FULL_NONCE_SIZE];
    n.copy_from_slice(&span[FULL_NONCE_OFF..FULL_NONCE_OFF + FULL_NONCE_SIZE]);
    n
}

/// Зашифровать span на месте: свежий nonce, payload -> ciphertext, tag в MAC.
pub fn page_encrypt_in_place(span: &mut [u8], key: &[u8; 32]) -> Result<()> {
    if span.len() < PAGE_HDR_SIZE {
        return Err(anyhow!("page buffer too small for encryption"));
    }

    // Свежие 128 бит nonce на каждый вызов
    let mut rnd = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut rnd);
    span[OFF_NONCE..OFF_NONCE + NONCE_SIZE].copy_from_slice(&rnd);

    let nonce = full_nonce(span);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let (hdr, payload) = span.split_at_mut(PAGE_HDR_SIZE);
    let aad = &hdr[..AEAD_AAD_LEN];

    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, payload)
        .map_err(|e| anyhow!("page encrypt failed: {}", e))?;

    hdr[OFF_MAC..OFF_MAC + MAC_SIZE].copy_from_slice(tag.as_slice());
    Ok(())
}

/// Расшифровать span на месте, сверив AEAD-тег.
/// Ошибка аутентификации — порча данных или неверный ключ.
pub fn page_decrypt_in_place(span: &mut [u8], key: &[u8; 32]) -> Result<()> {
    if span.len() < PAGE_HDR_SIZE {
        return Err(anyhow!("page buffer too small for decryption"));
    }

    let nonce = full_nonce(span);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let (hdr, payload) = span.split_at_mut(PAGE_HDR_SIZE);
    let aad = &hdr[..AEAD_AAD_LEN];
    let mut tag = [0u8; MAC_SIZE];
    tag.copy_from_slice(&hdr[OFF_MAC..OFF_MAC + MAC_SIZE]);

    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            aad,
            payload,
            Tag::from_slice(&tag),
        )
        .map_err(|_| anyhow!("page AEAD tag verify failed (corrupted data or wrong key)"))?;
    Ok(())
}
