//! Status-file ingestion: per-instance sequence baselines, staleness,
//! duplicate coalescing.
//!
//! The worker is the single writer of the status file (atomic replace);
//! the supervisor polls it. An unreadable or malformed read is "no new
//! information", never an error. The decision logic here is pure over
//! explicit `now` values so the policies are testable without a clock.

use vigil_core::status::CaptureStatusRecord;

/// What a poll cycle learned from one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Fresh record; `advanced` is true when the sequence moved forward
    /// (always true for a never-sequenced legacy stream).
    Accepted {
        advanced: bool,
        /// capture_count went meaningfully backwards within one instance;
        /// usually a second writer
        regression: bool,
    },
    /// Out-of-order or legacy record, dropped with a diagnostic.
    Stale(String),
}

/// Tracks the last accepted record per worker instance.
///
/// `sequence` is strictly increasing within one `instance_id`; a new
/// instance resets the baseline, so a restarted worker legitimately starts
/// over at low numbers.
#[derive(Debug, Default)]
pub struct StatusTracker {
    instance_id: Option<String>,
    last_sequence: Option<u64>,
    last_capture_count: Option<u64>,
    /// `now` of the last sequence advance, for stall detection
    last_advance: Option<u64>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; called when a new worker is spawned.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn ingest(&mut self, record: &CaptureStatusRecord, now: u64) -> Ingest {
        if self.instance_id.as_deref() != Some(record.instance_id.as_str()) {
            // New instance: baseline resets.
            self.instance_id = Some(record.instance_id.clone());
            self.last_sequence = record.sequence;
            self.last_capture_count = Some(record.capture_count);
            self.last_advance = Some(now);
            return Ingest::Accepted {
                advanced: true,
                regression: false,
            };
        }

        match (record.sequence, self.last_sequence) {
            (Some(seq), Some(last)) if seq < last => {
                return Ingest::Stale(format!(
                    "sequence {seq} after {last} for instance {}",
                    record.instance_id
                ));
            }
            (None, Some(last)) => {
                return Ingest::Stale(format!(
                    "unsequenced record after sequence {last} for instance {}",
                    record.instance_id
                ));
            }
            _ => {}
        }

        let advanced = match (record.sequence, self.last_sequence) {
            (Some(seq), Some(last)) => seq > last,
            (Some(_), None) => true,
            // Unsequenced stream (legacy worker): no way to tell a re-read
            // from a new record, so every accepted one counts as progress.
            (None, _) => true,
        };
        if advanced {
            self.last_sequence = record.sequence;
            self.last_advance = Some(now);
        }

        let regression = self
            .last_capture_count
            .map(|last| record.capture_count < last)
            .unwrap_or(false);
        self.last_capture_count = Some(record.capture_count);

        Ingest::Accepted {
            advanced,
            regression,
        }
    }

    /// Pid alive but no sequence advance for longer than `window_secs`.
    pub fn stalled(&self, now: u64, window_secs: u64) -> bool {
        match self.last_advance {
            Some(at) => now.saturating_sub(at) > window_secs,
            None => false,
        }
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}

/// Aggregated duplicate-run summary, ready to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSummary {
    pub count: u32,
    pub window_title: Option<String>,
    pub window_secs: u64,
}

/// Coalesces consecutive duplicate-frame records into one summary log
/// line per run, instead of one line per duplicate.
///
/// A summary is emitted when the run ends (a non-duplicate record
/// arrives), or mid-run once the count or time thresholds are reached so
/// a long-idle desktop still surfaces periodically.
#[derive(Debug)]
pub struct DuplicateCoalescer {
    min_count: u32,
    window_secs: u64,
    run_count: u32,
    run_started: u64,
    window_title: Option<String>,
}

impl DuplicateCoalescer {
    pub fn new(min_count: u32, window_secs: u64) -> Self {
        Self {
            min_count: min_count.max(1),
            window_secs,
            run_count: 0,
            run_started: 0,
            window_title: None,
        }
    }

    pub fn observe(&mut self, record: &CaptureStatusRecord, now: u64) -> Option<DuplicateSummary> {
        if !record.duplicate {
            return self.flush(now);
        }

        if self.run_count == 0 {
            self.run_started = now;
            self.window_title = record.window_title.clone();
        }
        self.run_count += 1;

        if self.run_count >= self.min_count
            || now.saturating_sub(self.run_started) >= self.window_secs
        {
            return self.flush(now);
        }
        None
    }

    /// End the current run, if any, and return its summary.
    pub fn flush(&mut self, now: u64) -> Option<DuplicateSummary> {
        if self.run_count == 0 {
            return None;
        }
        let summary = DuplicateSummary {
            count: self.run_count,
            window_title: self.window_title.take(),
            window_secs: now.saturating_sub(self.run_started),
        };
        self.run_count = 0;
        Some(summary)
    }
}

/// Read and parse the status file; `None` covers absent, partial, and
/// malformed files alike.
pub fn read_status_file(path: &std::path::Path) -> Option<CaptureStatusRecord> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!("status file unparsable: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::status::CaptureBackend;

    fn record(instance: &str, sequence: Option<u64>, capture_count: u64) -> CaptureStatusRecord {
        CaptureStatusRecord {
            sequence,
            instance_id: instance.into(),
            capture_count,
            window_title: None,
            backend: CaptureBackend::Pipewire,
            error: None,
            duplicate: false,
            timestamp: 0,
        }
    }

    fn dup(title: &str) -> CaptureStatusRecord {
        CaptureStatusRecord {
            window_title: Some(title.into()),
            duplicate: true,
            ..record("i", Some(1), 1)
        }
    }

    #[test]
    fn test_in_order_sequences_accepted() {
        let mut t = StatusTracker::new();
        for seq in 1..=3 {
            let out = t.ingest(&record("a", Some(seq), seq), seq);
            assert!(matches!(out, Ingest::Accepted { .. }), "seq {seq}: {out:?}");
        }
        assert_eq!(t.last_sequence(), Some(3));
    }

    #[test]
    fn test_out_of_order_dropped() {
        let mut t = StatusTracker::new();
        t.ingest(&record("a", Some(3), 3), 10);
        let out = t.ingest(&record("a", Some(2), 4), 11);
        assert!(matches!(out, Ingest::Stale(_)));
        assert_eq!(t.last_sequence(), Some(3));
    }

    #[test]
    fn test_equal_sequence_accepted_but_not_advanced() {
        let mut t = StatusTracker::new();
        t.ingest(&record("a", Some(3), 3), 10);
        let out = t.ingest(&record("a", Some(3), 3), 11);
        assert_eq!(
            out,
            Ingest::Accepted {
                advanced: false,
                regression: false
            }
        );
    }

    #[test]
    fn test_new_instance_resets_baseline() {
        let mut t = StatusTracker::new();
        t.ingest(&record("a", Some(3), 30), 10);
        // Instance B starting at sequence 1 is a legitimate restart.
        let out = t.ingest(&record("b", Some(1), 1), 11);
        assert!(matches!(out, Ingest::Accepted { .. }));
        assert_eq!(t.last_sequence(), Some(1));
    }

    #[test]
    fn test_unsequenced_after_sequenced_is_stale() {
        let mut t = StatusTracker::new();
        t.ingest(&record("a", Some(2), 2), 10);
        let out = t.ingest(&record("a", None, 3), 11);
        assert!(matches!(out, Ingest::Stale(_)));
    }

    #[test]
    fn test_legacy_records_tolerated_when_never_sequenced() {
        let mut t = StatusTracker::new();
        let out = t.ingest(&record("old", None, 1), 10);
        assert!(matches!(out, Ingest::Accepted { .. }));
        // Without sequences every accepted record counts as progress.
        let out = t.ingest(&record("old", None, 2), 11);
        assert_eq!(
            out,
            Ingest::Accepted {
                advanced: true,
                regression: false
            }
        );
    }

    #[test]
    fn test_capture_count_regression_flagged() {
        let mut t = StatusTracker::new();
        t.ingest(&record("a", Some(1), 50), 10);
        let out = t.ingest(&record("a", Some(2), 10), 11);
        assert_eq!(
            out,
            Ingest::Accepted {
                advanced: true,
                regression: true
            }
        );
    }

    #[test]
    fn test_stall_detection_window() {
        let mut t = StatusTracker::new();
        t.ingest(&record("a", Some(1), 1), 100);
        assert!(!t.stalled(150, 120));
        assert!(t.stalled(221, 120));
        // An advance resets the clock
        t.ingest(&record("a", Some(2), 2), 222);
        assert!(!t.stalled(300, 120));
    }

    #[test]
    fn test_fresh_tracker_never_stalled() {
        let t = StatusTracker::new();
        assert!(!t.stalled(10_000, 1));
    }

    #[test]
    fn test_three_duplicates_one_summary() {
        let mut c = DuplicateCoalescer::new(5, 60);
        assert_eq!(c.observe(&dup("editor"), 0), None);
        assert_eq!(c.observe(&dup("editor"), 1), None);
        assert_eq!(c.observe(&dup("editor"), 2), None);
        // The run ends; exactly one aggregated entry comes out.
        let summary = c.observe(&record("i", Some(4), 4), 3).unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.window_title.as_deref(), Some("editor"));
        // And nothing further for the non-duplicate itself
        assert_eq!(c.observe(&record("i", Some(5), 5), 4), None);
    }

    #[test]
    fn test_min_count_emits_mid_run() {
        let mut c = DuplicateCoalescer::new(2, 60);
        assert_eq!(c.observe(&dup("t"), 0), None);
        let summary = c.observe(&dup("t"), 1).unwrap();
        assert_eq!(summary.count, 2);
        // Counter restarts after the summary
        assert_eq!(c.observe(&dup("t"), 2), None);
    }

    #[test]
    fn test_time_window_emits_mid_run() {
        let mut c = DuplicateCoalescer::new(100, 60);
        assert_eq!(c.observe(&dup("t"), 0), None);
        let summary = c.observe(&dup("t"), 61).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.window_secs, 61);
    }

    #[test]
    fn test_read_status_file_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        assert!(read_status_file(&path).is_none(), "absent");
        std::fs::write(&path, b"{trunc").unwrap();
        assert!(read_status_file(&path).is_none(), "malformed");
        let rec = record("a", Some(1), 1);
        std::fs::write(&path, serde_json::to_vec(&rec).unwrap()).unwrap();
        assert_eq!(read_status_file(&path).unwrap().instance_id, "a");
    }
}
