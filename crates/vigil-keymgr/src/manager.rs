//! KeyManager: create / validate / change / recover over the wrapped key
//!
//! Failure semantics (load-bearing, see the error taxonomy):
//! - complexity violations and malformed usage never touch lockout state
//! - integrity failures during unwrap are invalid-secret failures
//! - lockout is time-gated: while locked even the correct secret is
//!   refused, without incrementing the failure count
//! - destructive reset wipes key material but never the process; it
//!   reports a structured error so the UI can offer the recovery path

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use vigil_core::config::VigilConfig;
use vigil_core::{VigilError, VigilResult};
use vigil_crypto::{
    generate_data_key, unwrap_key, wrap_key, DataKey, WrapKey, WrappedKey, KEY_SIZE,
    MIN_PBKDF2_ITERATIONS,
};

use crate::complexity::classify_secret;
use crate::keychain::{entries, Keychain};
use crate::lockout::{FailureOutcome, LockStatus, LockoutPolicy, LockoutState};
use crate::store::KeyStore;

pub struct KeyManager {
    store: KeyStore,
    keychain: Keychain,
    policy: LockoutPolicy,
    iterations: u32,
}

impl KeyManager {
    /// Production constructor: paths and policy from config, iteration
    /// count clamped to the floor.
    pub fn new(config: &VigilConfig) -> Self {
        let store = KeyStore::new(&config.daemon.data_dir);
        let keychain = Keychain::new(store.keychain_fallback_path());
        Self {
            keychain,
            policy: LockoutPolicy::from_config(&config.lockout),
            iterations: config.crypto.pbkdf2_iterations.max(MIN_PBKDF2_ITERATIONS),
            store,
        }
    }

    /// Assemble from explicit parts. Lets callers supply a fallback-only
    /// keychain or a reduced iteration count (tests).
    pub fn from_parts(
        store: KeyStore,
        keychain: Keychain,
        policy: LockoutPolicy,
        iterations: u32,
    ) -> Self {
        Self {
            store,
            keychain,
            policy,
            iterations,
        }
    }

    pub fn store(&self) -> &KeyStore {
        &self.store
    }

    /// Whether passphrase protection has been set up.
    pub fn is_protected(&self) -> bool {
        self.store.is_protected()
    }

    /// Set up protection: derive a wrap key from `passphrase`, generate
    /// and wrap the data key, seed the keychain challenge, and issue a
    /// recovery token.
    ///
    /// Complexity rejection happens before anything is written and never
    /// consumes a lockout attempt.
    pub fn create(&self, passphrase: &SecretString) -> VigilResult<String> {
        classify_secret(passphrase.expose_secret())?;

        let data_key = generate_data_key();
        let envelope = WrappedKey::seal(passphrase, &data_key, self.iterations)?;
        self.store.store_wrapped_key(&envelope)?;

        self.seed_challenge(&data_key)?;

        let recovery = generate_token();
        self.keychain
            .set(entries::RECOVERY_TOKEN, &SecretString::from(recovery.clone()))
            .context("storing recovery token")?;
        self.seed_recovery_key(&data_key, &recovery)?;

        self.store.store_lockstate(&self.policy.cleared())?;
        tracing::info!("key protection created");
        Ok(recovery)
    }

    /// Validate a secret and return the unwrapped data key.
    ///
    /// Checks the lockout gate first; a locked state rejects immediately
    /// (even for the correct secret) without counting a failure. The
    /// caller decides whether an `InvalidSecret` outcome is genuine and
    /// then calls [`record_failure`](Self::record_failure).
    pub fn validate(&self, passphrase: &SecretString) -> VigilResult<DataKey> {
        let state = self.store.load_lockstate();
        match self.policy.status(&state, now_epoch()) {
            LockStatus::Destroyed => return Err(VigilError::DestructiveReset),
            LockStatus::Locked { remaining_secs } => {
                return Err(VigilError::Locked {
                    retry_after_secs: remaining_secs,
                })
            }
            LockStatus::Open => {}
        }

        let envelope = self
            .store
            .load_wrapped_key()?
            .ok_or(VigilError::NotInitialized)?;

        let data_key = envelope
            .open(passphrase)
            .map_err(|_| VigilError::InvalidSecret)?;

        self.verify_challenge(&data_key)?;

        if state != LockoutState::default() {
            self.store.store_lockstate(&self.policy.cleared())?;
        }
        Ok(data_key)
    }

    /// Advance the lockout schedule by one genuine invalid-secret failure.
    ///
    /// At the destructive tier the wrapped key and keychain material are
    /// wiped; the encrypted artifacts become unrecoverable without the
    /// recovery token. Deliberate: confidentiality over availability.
    pub fn record_failure(&self) -> VigilResult<(LockoutState, FailureOutcome)> {
        let state = self.store.load_lockstate();
        let (next, outcome) = self.policy.register_failure(&state, now_epoch());
        self.store.store_lockstate(&next)?;

        match outcome {
            FailureOutcome::Locked { total, lock_secs } => {
                tracing::warn!(total, lock_secs, "failed unlock attempt recorded");
            }
            FailureOutcome::DestructiveReset { total } => {
                tracing::error!(total, "destructive reset: wiping key material");
                self.store.destroy_sensitive()?;
                for entry in [
                    entries::CHALLENGE,
                    entries::RECOVERY_TOKEN,
                    entries::RECOVERY_KEY,
                    entries::AUTOSTART_KEY,
                ] {
                    if let Err(e) = self.keychain.delete(entry) {
                        tracing::warn!(entry, "keychain wipe failed: {e}");
                    }
                }
            }
        }
        Ok((next, outcome))
    }

    /// Read-only lockout snapshot for UI polling.
    pub fn lock_info(&self) -> LockoutState {
        self.store.load_lockstate()
    }

    /// Current gate standing (recomputed, not stored).
    pub fn lock_status(&self) -> LockStatus {
        self.policy.status(&self.store.load_lockstate(), now_epoch())
    }

    /// Re-wrap the data key under a new secret.
    ///
    /// `old_secret` is either the current passphrase/PIN or, with
    /// `use_recovery`, the current recovery token. Success rotates the
    /// recovery token and invalidates the previous one.
    pub fn change(
        &self,
        old_secret: &SecretString,
        new_secret: &SecretString,
        use_recovery: bool,
    ) -> VigilResult<String> {
        if !self.is_protected() {
            return Err(VigilError::NotInitialized);
        }
        classify_secret(new_secret.expose_secret())?;

        let data_key = if use_recovery {
            self.data_key_via_recovery(old_secret)?
        } else {
            self.validate(old_secret)?
        };

        let envelope = WrappedKey::seal(new_secret, &data_key, self.iterations)?;
        self.store.store_wrapped_key(&envelope)?;

        // Keep an existing autostart credential in step with the (unchanged)
        // data key, and leave it absent if the user never opted in.
        if self.keychain.get(entries::AUTOSTART_KEY)?.is_some() {
            self.keychain.set(
                entries::AUTOSTART_KEY,
                &SecretString::from(B64.encode(data_key.as_bytes())),
            )?;
        }

        let recovery = generate_token();
        self.keychain
            .set(entries::RECOVERY_TOKEN, &SecretString::from(recovery.clone()))
            .context("rotating recovery token")?;
        self.seed_recovery_key(&data_key, &recovery)?;
        tracing::info!(via_recovery = use_recovery, "secret changed, recovery token rotated");
        Ok(recovery)
    }

    /// The unattended-start credential, if autostart is enabled.
    pub fn autostart_key(&self) -> VigilResult<Option<DataKey>> {
        let Some(entry) = self.keychain.get(entries::AUTOSTART_KEY)? else {
            return Ok(None);
        };
        match decode_key(entry.expose_secret()) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                tracing::warn!("autostart key unreadable: {e} (treating as absent)");
                Ok(None)
            }
        }
    }

    /// Enable or disable unattended background capture.
    ///
    /// Enabling requires an unwrapped data key from the current session;
    /// disabling deletes the stored credential.
    pub fn set_autostart_enabled(
        &self,
        enabled: bool,
        data_key: Option<&DataKey>,
    ) -> VigilResult<()> {
        if enabled {
            let key = data_key.ok_or_else(|| {
                VigilError::Config("enabling autostart requires an unlocked session".into())
            })?;
            self.keychain.set(
                entries::AUTOSTART_KEY,
                &SecretString::from(B64.encode(key.as_bytes())),
            )?;
            tracing::info!("autostart credential stored");
        } else {
            self.keychain.delete(entries::AUTOSTART_KEY)?;
            tracing::info!("autostart credential deleted");
        }
        Ok(())
    }

    // ── internals ─────────────────────────────────────────────────────────

    fn data_key_via_recovery(&self, token: &SecretString) -> VigilResult<DataKey> {
        let stored = self
            .keychain
            .get(entries::RECOVERY_TOKEN)?
            .ok_or(VigilError::InvalidSecret)?;
        if !tokens_match(stored.expose_secret(), token.expose_secret()) {
            return Err(VigilError::InvalidSecret);
        }
        let entry = self
            .keychain
            .get(entries::RECOVERY_KEY)?
            .ok_or(VigilError::InvalidSecret)?;
        let blob = B64
            .decode(entry.expose_secret())
            .map_err(|_| VigilError::InvalidSecret)?;
        let wrap = recovery_wrap_key(token.expose_secret()).map_err(|_| VigilError::InvalidSecret)?;
        unwrap_key(&wrap, &blob).map_err(|_| VigilError::InvalidSecret)
    }

    /// Wrap the data key under the recovery token bytes so the token alone
    /// can recover it, independent of the passphrase and of autostart.
    fn seed_recovery_key(&self, data_key: &DataKey, token: &str) -> Result<()> {
        let wrap = recovery_wrap_key(token)?;
        let blob = wrap_key(&wrap, data_key)?;
        self.keychain
            .set(entries::RECOVERY_KEY, &SecretString::from(B64.encode(&blob)))
            .context("storing recovery-wrapped key")
    }

    /// Wrap a random challenge under the data key so later validations can
    /// confirm an unwrapped key matches the stored artifacts, not just the
    /// envelope.
    fn seed_challenge(&self, data_key: &DataKey) -> Result<()> {
        let mut challenge = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut challenge);
        let token = wrap_key(
            &WrapKey::from_bytes(*data_key.as_bytes()),
            &DataKey::from_bytes(challenge),
        )?;
        self.keychain
            .set(entries::CHALLENGE, &SecretString::from(B64.encode(&token)))
            .context("storing challenge")
    }

    fn verify_challenge(&self, data_key: &DataKey) -> VigilResult<()> {
        match self.keychain.get(entries::CHALLENGE)? {
            Some(entry) => {
                let token = B64
                    .decode(entry.expose_secret())
                    .map_err(|_| VigilError::InvalidSecret)?;
                unwrap_key(&WrapKey::from_bytes(*data_key.as_bytes()), &token)
                    .map_err(|_| VigilError::InvalidSecret)?;
                Ok(())
            }
            None => {
                // Older installation without a challenge; seed one now.
                if let Err(e) = self.seed_challenge(data_key) {
                    tracing::warn!("challenge seeding failed: {e}");
                }
                Ok(())
            }
        }
    }
}

/// High-entropy opaque token (base64 of 32 random bytes).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}

/// Constant-time token comparison via digest equality, so the recovery
/// path cannot become a byte-by-byte timing oracle.
pub fn tokens_match(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

/// The recovery token is base64 of exactly [`KEY_SIZE`] random bytes, so
/// the decoded bytes serve directly as a wrap key.
fn recovery_wrap_key(token: &str) -> Result<WrapKey> {
    let bytes = B64.decode(token.trim()).context("recovery token decode")?;
    let arr: [u8; KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("recovery token has the wrong length"))?;
    Ok(WrapKey::from_bytes(arr))
}

fn decode_key(b64: &str) -> Result<DataKey> {
    let bytes = B64.decode(b64.trim()).context("base64 decode")?;
    let arr: [u8; KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("wrong key length"))?;
    Ok(DataKey::from_bytes(arr))
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
