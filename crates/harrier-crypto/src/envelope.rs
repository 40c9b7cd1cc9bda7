//! The ASCII-safe symmetric envelope: `base64(nonce || ciphertext+tag)`.
//!
//! Binary in, text out. The 192-bit XChaCha20 nonce is drawn fresh per
//! message, so random generation is collision-safe without per-implant
//! counters.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::{CryptoError, ImplantKey};

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt a payload into the ASCII envelope form.
///
/// # Errors
///
/// Returns `CryptoError::EncryptionFailed` if the AEAD rejects the input.
pub fn encrypt(plaintext: impl AsRef<[u8]>, key: &ImplantKey) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    framed.extend_from_slice(&nonce_bytes);
    framed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(framed))
}

/// Decrypt an envelope to raw bytes.
///
/// # Errors
///
/// Fails on malformed base64, a truncated frame, or an authentication
/// mismatch (wrong key or tampered ciphertext).
pub fn decrypt_to_bytes(envelope: &str, key: &ImplantKey) -> Result<Vec<u8>, CryptoError> {
    let framed = BASE64
        .decode(envelope.trim())
        .map_err(|_| CryptoError::MalformedEnvelope)?;

    if framed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::TruncatedEnvelope {
            actual: framed.len(),
        });
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XNonce::from_slice(&framed[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &framed[NONCE_SIZE..])
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Decrypt an envelope to a UTF-8 string.
///
/// # Errors
///
/// As [`decrypt_to_bytes`], plus `CryptoError::NotUtf8` when the plaintext is
/// not valid UTF-8.
pub fn decrypt(envelope: &str, key: &ImplantKey) -> Result<String, CryptoError> {
    let bytes = decrypt_to_bytes(envelope, key)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::NotUtf8)
}
