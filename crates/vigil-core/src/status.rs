use serde::{Deserialize, Serialize};

/// Screen capture backend the worker is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackend {
    /// PipeWire/portal capture (default on Wayland sessions)
    Pipewire,
    /// Direct X11 capture
    X11,
}

impl CaptureBackend {
    /// The backend the supervisor switches to when this one keeps failing.
    pub fn alternate(self) -> Self {
        match self {
            CaptureBackend::Pipewire => CaptureBackend::X11,
            CaptureBackend::X11 => CaptureBackend::Pipewire,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaptureBackend::Pipewire => "pipewire",
            CaptureBackend::X11 => "x11",
        }
    }
}

impl std::fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CaptureBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipewire" => Ok(CaptureBackend::Pipewire),
            "x11" => Ok(CaptureBackend::X11),
            other => Err(format!("unknown capture backend: {other}")),
        }
    }
}

/// Structured failure classification emitted by the worker.
///
/// The supervisor's adaptation logic matches on these variants rather
/// than pattern-matching log text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureErrorKind {
    /// No display/compositor could be acquired
    DisplayUnavailable,
    /// Backend failed to initialize (counts toward backend switching)
    BackendInit,
    /// Screen capture permission denied by the session
    PermissionDenied,
    /// A single capture cycle failed
    CaptureFailed,
    /// Anything the worker could not classify
    Other,
}

impl CaptureErrorKind {
    /// Whether this error participates in the health/backoff restart policy.
    pub fn is_restartable(self) -> bool {
        matches!(
            self,
            CaptureErrorKind::DisplayUnavailable | CaptureErrorKind::BackendInit
        )
    }

    /// Whether recurrence of this error should trigger a backend switch.
    pub fn indicates_backend_fault(self) -> bool {
        matches!(self, CaptureErrorKind::BackendInit)
    }
}

/// One status record written atomically by the worker each capture cycle.
///
/// `sequence` is strictly increasing within one `instance_id`; a new
/// instance legitimately starts over at low sequence numbers. Records from
/// legacy workers may lack `sequence` entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatusRecord {
    #[serde(default)]
    pub sequence: Option<u64>,
    /// Opaque id unique per worker process start (not the OS pid)
    pub instance_id: String,
    pub capture_count: u64,
    #[serde(default)]
    pub window_title: Option<String>,
    pub backend: CaptureBackend,
    #[serde(default)]
    pub error: Option<CaptureErrorKind>,
    /// Frame identical to the previous one; suppressed by the worker
    #[serde(default)]
    pub duplicate: bool,
    /// Unix timestamp (seconds) of the capture cycle
    pub timestamp: u64,
}
