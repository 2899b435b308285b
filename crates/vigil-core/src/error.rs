use thiserror::Error;

pub type VigilResult<T> = Result<T, VigilError>;

#[derive(Debug, Error)]
pub enum VigilError {
    /// Secret never met policy; not a security failure and never counted
    /// toward lockout.
    #[error("secret does not meet passphrase or PIN complexity requirements")]
    Complexity,

    /// Wrong passphrase/PIN, or an integrity failure during unwrap (the
    /// two are deliberately indistinguishable).
    #[error("invalid secret")]
    InvalidSecret,

    /// Validation is rate-limited until the lock expires. Correct secrets
    /// are rejected too while locked.
    #[error("locked out; retry in {retry_after_secs}s")]
    Locked { retry_after_secs: u64 },

    /// The wrapped key and keychain material were destroyed after
    /// excessive failures. Data is recoverable only via the recovery token.
    #[error("protected key destroyed after excessive failed attempts")]
    DestructiveReset,

    /// No wrapped key exists yet; `create` has not been run.
    #[error("key protection not initialized")]
    NotInitialized,

    /// Malformed or unauthorized unlock-channel request. Never reveals
    /// which part of the request was wrong.
    #[error("invalid request")]
    Protocol,

    /// Out-of-order or unsequenced status record. Diagnostic only.
    #[error("stale status record: {0}")]
    StaleStatus(String),

    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
