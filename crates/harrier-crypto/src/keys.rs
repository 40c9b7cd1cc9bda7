//! Key material and the XOR masking used for on-the-wire key delivery.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::CryptoError;

/// Symmetric key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Per-implant symmetric key. Immutable after creation, zeroized on drop.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct ImplantKey([u8; KEY_SIZE]);

impl ImplantKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Raw key bytes. Never log or serialize these.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ImplantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redacted: key material must not reach logs.
        f.write_str("ImplantKey(..)")
    }
}

/// Listener-wide masking secret, generated once at process startup.
#[derive(Clone, ZeroizeOnDrop)]
pub struct XorKey([u8; KEY_SIZE]);

impl XorKey {
    /// Generate a fresh startup secret.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for XorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("XorKey(..)")
    }
}

/// Byte-wise XOR of two equal-length buffers.
///
/// # Errors
///
/// Returns `CryptoError::MaskLengthMismatch` when the lengths differ.
pub fn xor_mask(key: &[u8], mask: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != mask.len() {
        return Err(CryptoError::MaskLengthMismatch {
            key: key.len(),
            mask: mask.len(),
        });
    }
    Ok(key.iter().zip(mask.iter()).map(|(k, m)| k ^ m).collect())
}

/// Wire form of a key: `base64(key XOR mask)`. The raw key never leaves the
/// process.
#[must_use]
pub fn mask_key(key: &ImplantKey, mask: &XorKey) -> String {
    let masked: Vec<u8> = key
        .as_bytes()
        .iter()
        .zip(mask.as_bytes().iter())
        .map(|(k, m)| k ^ m)
        .collect();
    BASE64.encode(masked)
}

/// Inverse of [`mask_key`]. Used by implant-side tooling and tests.
///
/// # Errors
///
/// Returns `CryptoError::MalformedEnvelope` on bad base64 and
/// `CryptoError::InvalidKeyLength` when the decoded buffer is not 32 bytes.
pub fn unmask_key(encoded: &str, mask: &XorKey) -> Result<ImplantKey, CryptoError> {
    let masked = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::MalformedEnvelope)?;
    let raw = xor_mask(&masked, mask.as_bytes())?;
    ImplantKey::from_slice(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_xor_mask_is_involution() {
        let key = [0xAAu8; KEY_SIZE];
        let mask = [0x55u8; KEY_SIZE];
        let once = xor_mask(&key, &mask).unwrap();
        let twice = xor_mask(&once, &mask).unwrap();
        assert_eq!(twice, key.to_vec());
    }

    #[test]
    fn test_xor_mask_rejects_length_mismatch() {
        let err = xor_mask(&[0u8; 4], &[0u8; 8]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::MaskLengthMismatch { key: 4, mask: 8 }
        ));
    }

    #[test]
    fn test_mask_key_round_trip() {
        let key = ImplantKey::generate();
        let mask = XorKey::generate();

        let wire = mask_key(&key, &mask);
        let recovered = unmask_key(&wire, &mask).unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_mask_key_hides_raw_key() {
        // The wire form must differ from a straight base64 of the key for any
        // non-degenerate mask.
        let key = ImplantKey::from_bytes([7u8; KEY_SIZE]);
        let mask = XorKey::from_bytes([1u8; KEY_SIZE]);

        let wire = mask_key(&key, &mask);
        let plain = BASE64.encode(key.as_bytes());
        assert_ne!(wire, plain);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = ImplantKey::from_bytes([0x41u8; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert_eq!(rendered, "ImplantKey(..)");
        assert!(!rendered.contains('A'));
    }

    #[test]
    fn test_from_slice_wrong_length() {
        assert!(ImplantKey::from_slice(&[0u8; 16]).is_err());
        assert!(ImplantKey::from_slice(&[0u8; 33]).is_err());
        assert!(ImplantKey::from_slice(&[0u8; 32]).is_ok());
    }
}
