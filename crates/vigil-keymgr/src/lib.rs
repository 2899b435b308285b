//! vigil-keymgr: passphrase protection for the archive data key
//!
//! Orchestrates the on-disk key store, the platform keychain, and the
//! lockout policy behind one [`KeyManager`] facade:
//!
//! - `create` / `validate` / `change` over a PBKDF2-wrapped data key
//! - escalating lockout with a destructive-reset tier
//! - opaque recovery tokens, rotated on every secret change
//! - an optional autostart credential for unattended unlock
//!
//! All operations are synchronous and file-backed; the daemon runs the
//! CPU-bound ones on blocking threads.

pub mod complexity;
pub mod keychain;
pub mod lockout;
pub mod manager;
pub mod store;

pub use complexity::{classify_secret, SecretKind};
pub use keychain::Keychain;
pub use lockout::{FailureOutcome, LockStatus, LockoutPolicy, LockoutState};
pub use manager::KeyManager;
pub use store::KeyStore;
