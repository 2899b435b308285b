//! Data key generation and authenticated wrapping

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::kdf::WrapKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// The 256-bit symmetric key that encrypts all captured artifacts.
/// Never persisted unwrapped except as the explicit autostart credential.
/// Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

/// Generate a random 256-bit data key.
pub fn generate_data_key() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// Wrap (encrypt) the data key under a wrap key.
///
/// Uses XChaCha20-Poly1305 with a random nonce.
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_key(wrap: &WrapKey, data_key: &DataKey) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(wrap.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data_key.as_bytes().as_ref())
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) the data key.
///
/// Input: `[24-byte nonce][ciphertext + 16-byte tag]` (output of `wrap_key`)
///
/// A tag mismatch is indistinguishable from a wrong wrap key; callers must
/// treat both as an invalid secret.
pub fn unwrap_key(wrap: &WrapKey, wrapped: &[u8]) -> anyhow::Result<DataKey> {
    if wrapped.len() < NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        anyhow::bail!(
            "wrapped key too short: {} bytes (expected at least {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(wrap.as_bytes().into());

    let mut plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("key unwrapping failed: invalid wrap key or corrupted data"))?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        anyhow::bail!(
            "unwrapped key has wrong size: {} bytes (expected {})",
            plaintext.len(),
            KEY_SIZE
        );
    }

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(DataKey::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wrap_key() -> WrapKey {
        WrapKey::from_bytes([42u8; KEY_SIZE])
    }

    #[test]
    fn test_data_key_generation() {
        let k1 = generate_data_key();
        let k2 = generate_data_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_key_wrap_unwrap_roundtrip() {
        let wrap = test_wrap_key();
        let data_key = generate_data_key();

        let wrapped = wrap_key(&wrap, &data_key).unwrap();
        let unwrapped = unwrap_key(&wrap, &wrapped).unwrap();

        assert_eq!(data_key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_key_unwrap_wrong_wrap_key() {
        let wrap1 = WrapKey::from_bytes([1u8; KEY_SIZE]);
        let wrap2 = WrapKey::from_bytes([2u8; KEY_SIZE]);
        let data_key = generate_data_key();

        let wrapped = wrap_key(&wrap1, &data_key).unwrap();
        let result = unwrap_key(&wrap2, &wrapped);

        assert!(result.is_err(), "unwrap with wrong wrap key must fail");
    }

    #[test]
    fn test_key_unwrap_tampered_ciphertext() {
        let wrap = test_wrap_key();
        let data_key = generate_data_key();

        let mut wrapped = wrap_key(&wrap, &data_key).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;

        assert!(
            unwrap_key(&wrap, &wrapped).is_err(),
            "tag mismatch must fail"
        );
    }

    #[test]
    fn test_wrapped_key_size() {
        let wrap = test_wrap_key();
        let data_key = generate_data_key();
        let wrapped = wrap_key(&wrap, &data_key).unwrap();

        // nonce (24) + key (32) + tag (16) = 72
        assert_eq!(wrapped.len(), NONCE_SIZE + KEY_SIZE + TAG_SIZE);
    }
}
