//! Platform keychain integration with a restricted-file fallback.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! Headless sessions and stripped-down desktops often have no secret
//! service, so every operation falls back to a 0600 JSON file next to the
//! wrapped key. Reads consult the platform store first, then the file.

use anyhow::Result;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::path::PathBuf;
use zeroize::Zeroize;

const SERVICE_NAME: &str = "vigil";

/// Well-known entry names
pub mod entries {
    /// Single-use recovery token (base64), rotated on every secret change
    pub const RECOVERY_TOKEN: &str = "recovery-token";
    /// Data key wrapped under the recovery token bytes, rotated with the
    /// token, so recovery works without any other credential
    pub const RECOVERY_KEY: &str = "recovery-key";
    /// Raw data key (base64) for unattended autostart unlock
    pub const AUTOSTART_KEY: &str = "autostart-key";
    /// Random challenge wrapped by the data key, proving an unwrapped key
    /// actually matches the stored artifacts
    pub const CHALLENGE: &str = "challenge";
}

pub struct Keychain {
    fallback_path: PathBuf,
    use_platform: bool,
}

impl Keychain {
    pub fn new(fallback_path: PathBuf) -> Self {
        Self {
            fallback_path,
            use_platform: true,
        }
    }

    /// A keychain that only uses the fallback file. For tests and
    /// environments known to lack a secret service.
    pub fn fallback_only(fallback_path: PathBuf) -> Self {
        Self {
            fallback_path,
            use_platform: false,
        }
    }

    /// Store a secret, falling back to the restricted file on any
    /// platform-store error.
    pub fn set(&self, name: &str, value: &SecretString) -> Result<()> {
        if self.use_platform {
            match keyring::Entry::new(SERVICE_NAME, name)
                .and_then(|e| e.set_password(value.expose_secret()))
            {
                Ok(()) => {
                    tracing::debug!(entry = name, "stored secret in platform keychain");
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(entry = name, "platform keychain store failed: {e} (using fallback file)");
                }
            }
        }
        self.fallback_set(name, value)
    }

    /// Retrieve a secret; platform store first, then the fallback file.
    pub fn get(&self, name: &str) -> Result<Option<SecretString>> {
        if self.use_platform {
            match keyring::Entry::new(SERVICE_NAME, name).and_then(|e| e.get_password()) {
                Ok(mut password) => {
                    let secret = SecretString::from(password.clone());
                    password.zeroize();
                    return Ok(Some(secret));
                }
                Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    tracing::debug!(entry = name, "platform keychain get failed: {e} (trying fallback file)");
                }
            }
        }
        self.fallback_get(name)
    }

    /// Delete a secret from both the platform store and the fallback file.
    pub fn delete(&self, name: &str) -> Result<()> {
        if self.use_platform {
            match keyring::Entry::new(SERVICE_NAME, name).and_then(|e| e.delete_credential()) {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => {
                    tracing::debug!(entry = name, "platform keychain delete failed: {e}");
                }
            }
        }
        self.fallback_delete(name)
    }

    // ── Fallback file ─────────────────────────────────────────────────────

    fn load_fallback(&self) -> HashMap<String, String> {
        match std::fs::read(&self.fallback_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save_fallback(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.fallback_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(map)?;
        crate::store::atomic_write_restricted(&self.fallback_path, &bytes)?;
        Ok(())
    }

    fn fallback_set(&self, name: &str, value: &SecretString) -> Result<()> {
        let mut map = self.load_fallback();
        map.insert(name.to_string(), value.expose_secret().to_string());
        self.save_fallback(&map)
    }

    fn fallback_get(&self, name: &str) -> Result<Option<SecretString>> {
        Ok(self.load_fallback().remove(name).map(SecretString::from))
    }

    fn fallback_delete(&self, name: &str) -> Result<()> {
        let mut map = self.load_fallback();
        if map.remove(name).is_some() {
            self.save_fallback(&map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keychain() -> (tempfile::TempDir, Keychain) {
        let dir = tempfile::tempdir().unwrap();
        let kc = Keychain::fallback_only(dir.path().join("keyring_fallback.json"));
        (dir, kc)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (_dir, kc) = test_keychain();
        kc.set("token", &SecretString::from("sekrit")).unwrap();
        let got = kc.get("token").unwrap().unwrap();
        assert_eq!(got.expose_secret(), "sekrit");
    }

    #[test]
    fn test_get_absent_is_none() {
        let (_dir, kc) = test_keychain();
        assert!(kc.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_entry() {
        let (_dir, kc) = test_keychain();
        kc.set("token", &SecretString::from("sekrit")).unwrap();
        kc.delete("token").unwrap();
        assert!(kc.get("token").unwrap().is_none());
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let (_dir, kc) = test_keychain();
        kc.delete("never-existed").unwrap();
    }

    #[test]
    fn test_entries_are_independent() {
        let (_dir, kc) = test_keychain();
        kc.set(entries::RECOVERY_TOKEN, &SecretString::from("r"))
            .unwrap();
        kc.set(entries::AUTOSTART_KEY, &SecretString::from("a"))
            .unwrap();
        kc.delete(entries::RECOVERY_TOKEN).unwrap();
        assert!(kc.get(entries::RECOVERY_TOKEN).unwrap().is_none());
        assert!(kc.get(entries::AUTOSTART_KEY).unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_file_is_restricted() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, kc) = test_keychain();
        kc.set("token", &SecretString::from("sekrit")).unwrap();
        let meta = std::fs::metadata(dir.path().join("keyring_fallback.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
