//! Versioned wrapped-key envelope
//!
//! The on-disk representation of the protected data key:
//! - KDF parameters (salt, iteration count, algorithm id)
//! - cipher id
//! - the wrapped key blob (nonce + ciphertext + tag)
//!
//! Parameters travel with the envelope so iteration-count defaults can be
//! raised without invalidating existing installations.

use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::kdf::derive_wrap_key;
use crate::keys::{unwrap_key, wrap_key, DataKey};
use crate::SALT_SIZE;

const ENVELOPE_VERSION: u32 = 1;
const KDF_ID: &str = "pbkdf2-hmac-sha256";
const CIPHER_ID: &str = "xchacha20poly1305";

/// A wrapped data key with everything needed to unwrap it again given the
/// original passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Envelope format version
    pub version: u32,
    /// KDF algorithm id
    pub kdf: String,
    /// PBKDF2 salt (base64, 16 bytes)
    pub salt: String,
    /// PBKDF2 iteration count used at wrap time
    pub iterations: u32,
    /// AEAD cipher id
    pub cipher: String,
    /// `[nonce][ciphertext + tag]` (base64)
    pub blob: String,
}

impl WrappedKey {
    /// Wrap a data key under a fresh salt derived from `passphrase`.
    ///
    /// The iteration count is taken as given; production callers clamp it
    /// to [`MIN_PBKDF2_ITERATIONS`](crate::MIN_PBKDF2_ITERATIONS) first.
    pub fn seal(
        passphrase: &SecretString,
        data_key: &DataKey,
        iterations: u32,
    ) -> anyhow::Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let wrap = derive_wrap_key(passphrase, &salt, iterations)?;
        let blob = wrap_key(&wrap, data_key)?;

        Ok(Self {
            version: ENVELOPE_VERSION,
            kdf: KDF_ID.into(),
            salt: base64_encode(&salt),
            iterations,
            cipher: CIPHER_ID.into(),
            blob: base64_encode(&blob),
        })
    }

    /// Re-derive the wrap key from the stored parameters and unwrap the
    /// data key. Any integrity failure surfaces as a plain error; callers
    /// map it to an invalid-secret outcome.
    pub fn open(&self, passphrase: &SecretString) -> anyhow::Result<DataKey> {
        if self.version != ENVELOPE_VERSION {
            anyhow::bail!("unsupported envelope version: {}", self.version);
        }
        if self.kdf != KDF_ID {
            anyhow::bail!("unsupported KDF: {}", self.kdf);
        }
        if self.cipher != CIPHER_ID {
            anyhow::bail!("unsupported cipher: {}", self.cipher);
        }

        let salt_vec = base64_decode(&self.salt)?;
        let salt: [u8; SALT_SIZE] = salt_vec
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("envelope salt has wrong size"))?;

        let wrap = derive_wrap_key(passphrase, &salt, self.iterations)?;
        let blob = base64_decode(&self.blob)?;
        unwrap_key(&wrap, &blob)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| anyhow::anyhow!("envelope serialization: {e}"))
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow::anyhow!("envelope deserialization: {e}"))
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

fn base64_decode(s: &str) -> anyhow::Result<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(s)
        .map_err(|e| anyhow::anyhow!("base64 decode: {e}"))
}
