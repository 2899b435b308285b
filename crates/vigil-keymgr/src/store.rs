//! On-disk key store: wrapped-key envelope, lockout counters, unlock
//! descriptor paths.
//!
//! These files are the only durable state shared between key-manager
//! operations and the polling UI, so every write goes through atomic
//! write-temp-then-rename to avoid torn reads. Sensitive files are
//! created 0600 on Unix.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use vigil_crypto::WrappedKey;

use crate::lockout::LockoutState;

pub struct KeyStore {
    base_dir: PathBuf,
}

impl KeyStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding encrypted artifacts and key material
    pub fn enc_dir(&self) -> PathBuf {
        self.base_dir.join("encrypted")
    }

    pub fn wrapped_key_path(&self) -> PathBuf {
        self.enc_dir().join("key.wrapped.json")
    }

    pub fn lockstate_path(&self) -> PathBuf {
        self.enc_dir().join("lockstate.json")
    }

    /// Loopback unlock-channel descriptor (host, port, token)
    pub fn unlock_descriptor_path(&self) -> PathBuf {
        self.enc_dir().join("unlock.json")
    }

    /// Keychain fallback file for hosts without a secret service
    pub fn keychain_fallback_path(&self) -> PathBuf {
        self.enc_dir().join("keyring_fallback.json")
    }

    /// Status file written by the capture worker
    pub fn status_path(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.enc_dir())
            .with_context(|| format!("creating {}", self.enc_dir().display()))
    }

    /// Whether passphrase protection has been set up.
    pub fn is_protected(&self) -> bool {
        self.wrapped_key_path().exists()
    }

    pub fn load_wrapped_key(&self) -> Result<Option<WrappedKey>> {
        let path = self.wrapped_key_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(WrappedKey::from_bytes(&bytes)?))
    }

    pub fn store_wrapped_key(&self, env: &WrappedKey) -> Result<()> {
        self.ensure_dirs()?;
        let bytes = env.to_bytes()?;
        atomic_write_restricted(&self.wrapped_key_path(), &bytes)
            .context("persisting wrapped key")
    }

    /// Load lockout counters; a missing or malformed file reads as the
    /// zero state rather than an error.
    pub fn load_lockstate(&self) -> LockoutState {
        match std::fs::read(self.lockstate_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("malformed lockstate file: {e} (treating as zero state)");
                LockoutState::default()
            }),
            Err(_) => LockoutState::default(),
        }
    }

    pub fn store_lockstate(&self, state: &LockoutState) -> Result<()> {
        self.ensure_dirs()?;
        let bytes = serde_json::to_vec(state)?;
        atomic_write_restricted(&self.lockstate_path(), &bytes).context("persisting lockstate")
    }

    /// Remove the wrapped key and unlock descriptor. Called by the
    /// destructive-reset path; the encrypted artifacts stay on disk but
    /// are unrecoverable without the recovery token.
    pub fn destroy_sensitive(&self) -> Result<()> {
        for path in [self.wrapped_key_path(), self.unlock_descriptor_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::warn!(path = %path.display(), "destroyed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "destroy failed: {e}");
                }
            }
        }
        Ok(())
    }
}

/// Atomically replace `path` with `bytes`, creating the file 0600.
///
/// Writes to a temp file in the same directory, then renames, so a
/// concurrently polling reader sees either the old or the new content.
pub fn atomic_write_restricted(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use vigil_crypto::generate_data_key;

    fn test_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_not_protected_until_key_stored() {
        let (_dir, store) = test_store();
        assert!(!store.is_protected());
        assert!(store.load_wrapped_key().unwrap().is_none());

        let env = WrappedKey::seal(
            &SecretString::from("Store-Test-1!aa"),
            &generate_data_key(),
            1_000,
        )
        .unwrap();
        store.store_wrapped_key(&env).unwrap();

        assert!(store.is_protected());
        let loaded = store.load_wrapped_key().unwrap().unwrap();
        assert_eq!(loaded.salt, env.salt);
    }

    #[test]
    fn test_lockstate_defaults_when_missing() {
        let (_dir, store) = test_store();
        assert_eq!(store.load_lockstate(), LockoutState::default());
    }

    #[test]
    fn test_lockstate_roundtrip() {
        let (_dir, store) = test_store();
        let state = LockoutState {
            fails: 3,
            last_fail: Some(1000),
            lock_until: Some(2000),
            reset: false,
        };
        store.store_lockstate(&state).unwrap();
        assert_eq!(store.load_lockstate(), state);
    }

    #[test]
    fn test_malformed_lockstate_reads_as_zero() {
        let (_dir, store) = test_store();
        store.ensure_dirs().unwrap();
        std::fs::write(store.lockstate_path(), b"{not json").unwrap();
        assert_eq!(store.load_lockstate(), LockoutState::default());
    }

    #[test]
    fn test_destroy_sensitive_removes_key() {
        let (_dir, store) = test_store();
        let env = WrappedKey::seal(
            &SecretString::from("Destroy-Me-1!aa"),
            &generate_data_key(),
            1_000,
        )
        .unwrap();
        store.store_wrapped_key(&env).unwrap();
        assert!(store.is_protected());

        store.destroy_sensitive().unwrap();
        assert!(!store.is_protected());
        // Idempotent
        store.destroy_sensitive().unwrap();
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let (dir, store) = test_store();
        store.ensure_dirs().unwrap();
        let path = store.lockstate_path();
        atomic_write_restricted(&path, b"{}").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("encrypted"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_wrapped_key_file_is_restricted() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = test_store();
        let env = WrappedKey::seal(
            &SecretString::from("Perms-Test-1!aa"),
            &generate_data_key(),
            1_000,
        )
        .unwrap();
        store.store_wrapped_key(&env).unwrap();
        let meta = std::fs::metadata(store.wrapped_key_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
