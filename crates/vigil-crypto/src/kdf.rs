//! Key derivation: PBKDF2-HMAC-SHA256 passphrase → wrap key

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit key derived from a passphrase/PIN, used only to wrap and
/// unwrap the data key.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct WrapKey {
    bytes: [u8; KEY_SIZE],
}

impl WrapKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrapKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a 256-bit wrap key from a passphrase and salt via
/// PBKDF2-HMAC-SHA256.
///
/// The salt is 16 bytes, randomly generated at wrap time and stored in the
/// envelope alongside the iteration count (neither needs to be secret).
/// This is CPU-bound at realistic iteration counts; callers on an async
/// runtime should run it on a blocking thread.
pub fn derive_wrap_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    iterations: u32,
) -> anyhow::Result<WrapKey> {
    if iterations == 0 {
        anyhow::bail!("PBKDF2 iteration count must be non-zero");
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        passphrase.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut key,
    );

    Ok(WrapKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fast iteration count for tests only
    const TEST_ITERS: u32 = 1_000;

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_wrap_key(&passphrase, &salt, TEST_ITERS).unwrap();
        let key2 = derive_wrap_key(&passphrase, &salt, TEST_ITERS).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_wrap_key(&SecretString::from("passphrase-a"), &salt, TEST_ITERS).unwrap();
        let key2 = derive_wrap_key(&SecretString::from("passphrase-b"), &salt, TEST_ITERS).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different passphrases must produce different keys"
        );
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same-passphrase");

        let key1 = derive_wrap_key(&passphrase, &[1u8; SALT_SIZE], TEST_ITERS).unwrap();
        let key2 = derive_wrap_key(&passphrase, &[2u8; SALT_SIZE], TEST_ITERS).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different salts must produce different keys"
        );
    }

    #[test]
    fn test_kdf_different_iterations() {
        let passphrase = SecretString::from("same-passphrase");
        let salt = [3u8; SALT_SIZE];

        let key1 = derive_wrap_key(&passphrase, &salt, TEST_ITERS).unwrap();
        let key2 = derive_wrap_key(&passphrase, &salt, TEST_ITERS + 1).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_zero_iterations_rejected() {
        let result = derive_wrap_key(&SecretString::from("p"), &[0u8; SALT_SIZE], 0);
        assert!(result.is_err());
    }
}
