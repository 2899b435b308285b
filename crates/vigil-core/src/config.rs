use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::status::CaptureBackend;

/// Top-level daemon configuration (loaded from vigil.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub daemon: DaemonConfig,
    pub capture: CaptureConfig,
    pub lockout: LockoutConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket path for the UI control surface
    pub control_socket: PathBuf,
    /// Base data directory (wrapped key, lockstate, status file, artifacts)
    pub data_dir: PathBuf,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Seconds between worker capture cycles (passed through at spawn)
    pub interval_secs: u64,
    /// Preferred capture backend; the supervisor may switch this on
    /// recurring backend faults and persists the new preference
    pub backend: CaptureBackend,
    /// Worker executable
    pub worker_command: PathBuf,
    /// Extra worker arguments
    pub worker_args: Vec<String>,
    /// Seconds between status-file polls
    pub status_poll_secs: u64,
    /// No sequence advance for this long with a live pid = hang
    pub stall_window_secs: u64,
    /// Minimum delay between supervisor-initiated restarts
    pub restart_cooldown_secs: u64,
    /// Delay before restarting after a system resume/unlock
    pub resume_settle_secs: u64,
    /// Grace window between SIGTERM and forced kill
    pub stop_grace_secs: u64,
    /// Restartable-error count that triggers a restart before the worker
    /// has ever produced a successful capture
    pub error_threshold_initial: u32,
    /// Restartable-error count after at least one success
    pub error_threshold_steady: u32,
    /// Recurrences of a backend fault before switching backends
    pub backend_switch_threshold: u32,
    /// Coalesce duplicate-frame records into one summary after this many
    pub duplicate_log_min: u32,
    /// ...or after this many seconds, whichever comes first
    pub duplicate_log_window_secs: u64,
    /// Archive rotation: captured artifacts older than this are eligible
    /// for deletion by the worker (passed through at spawn)
    pub retention_days: u32,
}

/// Lockout escalation policy. Product policy, so configuration rather than
/// hardcoded constants; defaults favor confidentiality over availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Lock duration (seconds) per escalation stage; the last entry
    /// repeats for all later failures
    pub schedule_secs: Vec<u64>,
    /// Total failures at which the wrapped key is destroyed. Recovery is
    /// then only possible via the recovery token.
    pub max_total_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iteration count for new wrap envelopes.
    /// Existing envelopes keep the count they were written with.
    pub pbkdf2_iterations: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/run/vigild/vigild.sock"),
            data_dir: PathBuf::from("~/.local/share/vigil"),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            backend: CaptureBackend::Pipewire,
            worker_command: PathBuf::from("vigil-worker"),
            worker_args: Vec::new(),
            status_poll_secs: 2,
            stall_window_secs: 120,
            restart_cooldown_secs: 30,
            resume_settle_secs: 3,
            stop_grace_secs: 5,
            error_threshold_initial: 3,
            error_threshold_steady: 10,
            backend_switch_threshold: 3,
            duplicate_log_min: 5,
            duplicate_log_window_secs: 60,
            retention_days: 90,
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            // 5 minutes, 1 hour, 24 hours, then 24 hours per failure
            schedule_secs: vec![300, 3600, 86_400],
            max_total_attempts: 12,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 600_000,
        }
    }
}
