//! vigil-crypto: key protection for the activity archive
//!
//! Key hierarchy:
//! ```text
//! Wrap Key (256-bit, PBKDF2-HMAC-SHA256 from passphrase/PIN + random salt)
//!   └── Data Key (256-bit random, wrapped by the wrap key)
//!         └── encrypts every captured artifact at rest
//! ```
//!
//! Wrapping uses XChaCha20-Poly1305; the wrapped key is persisted in a
//! versioned JSON envelope carrying salt, iteration count, and algorithm
//! ids so parameters can change without invalidating old envelopes.

pub mod envelope;
pub mod kdf;
pub mod keys;

pub use envelope::WrappedKey;
pub use kdf::{derive_wrap_key, WrapKey};
pub use keys::{generate_data_key, unwrap_key, wrap_key, DataKey};

/// Size of a key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the PBKDF2 salt
pub const SALT_SIZE: usize = 16;

/// Floor on PBKDF2 iteration counts accepted from stored envelopes
pub const MIN_PBKDF2_ITERATIONS: u32 = 390_000;
