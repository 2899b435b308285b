//! Supervisor state machine: worker lifecycle, health policy, power
//! events.
//!
//! One supervisor, at most one worker. All coordination happens through
//! the status file (worker writes, supervisor polls) and the unlock
//! channel (worker fetches the key). The supervisor owns every piece of
//! mutable state here; commands from the control socket and results from
//! blocking key operations arrive over channels and are applied
//! sequentially in one event loop.
//!
//! Restart scheduling goes through a single cancellable pending slot with
//! a cooldown, so stall detection, error thresholds and backend switching
//! can all request restarts without storming.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use vigil_core::config::VigilConfig;
use vigil_core::status::{CaptureErrorKind, CaptureStatusRecord};
use vigil_core::VigilError;
use vigil_crypto::DataKey;
use vigil_keymgr::store::atomic_write_restricted;
use vigil_keymgr::{KeyManager, LockStatus};

use crate::process::{self, WorkerProcess};
use crate::status::{read_status_file, DuplicateCoalescer, Ingest, StatusTracker};
use crate::unlock::{KeySource, UnlockChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupState {
    /// No usable key; worker must not run
    Locked,
    /// A blocking validate/create is in flight
    Unlocking,
    /// Key available, worker not running
    Stopped,
    /// Spawn in flight
    Starting,
    Running,
    /// Stopped by a system event, will resume
    Paused,
    Stopping,
}

impl SupState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupState::Locked => "locked",
            SupState::Unlocking => "unlocking",
            SupState::Stopped => "stopped",
            SupState::Starting => "starting",
            SupState::Running => "running",
            SupState::Paused => "paused",
            SupState::Stopping => "stopping",
        }
    }
}

/// System power/session transitions, delivered via the control socket by
/// the desktop shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    SessionLocked,
    SessionUnlocked,
    Suspend,
    Resume,
    Shutdown,
}

impl std::str::FromStr for PowerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_locked" => Ok(PowerEvent::SessionLocked),
            "session_unlocked" => Ok(PowerEvent::SessionUnlocked),
            "suspend" => Ok(PowerEvent::Suspend),
            "resume" => Ok(PowerEvent::Resume),
            "shutdown" => Ok(PowerEvent::Shutdown),
            other => Err(format!("unknown power event: {other}")),
        }
    }
}

/// Control-surface commands; each carries its reply slot.
pub enum Command {
    Start(oneshot::Sender<Value>),
    Stop(oneshot::Sender<Value>),
    Status(oneshot::Sender<Value>),
    KillStray(oneshot::Sender<Value>),
    GetPrefs(oneshot::Sender<Value>),
    SetPrefs(Value, oneshot::Sender<Value>),
    CreateProtection(SecretString, oneshot::Sender<Value>),
    SubmitPassphrase(SecretString, oneshot::Sender<Value>),
    ChangePassphrase {
        old: SecretString,
        new: SecretString,
        use_recovery: bool,
        resp: oneshot::Sender<Value>,
    },
    LockInfo(oneshot::Sender<Value>),
    SetAutostart(bool, oneshot::Sender<Value>),
    Power(PowerEvent, oneshot::Sender<Value>),
    Shutdown,
}

/// Results of blocking key operations, fed back into the event loop.
pub enum Event {
    Unlocked { passphrase: SecretString, key: DataKey },
    UnlockFailed,
    Rotated { passphrase: SecretString, key: DataKey },
}

// ── Restart scheduling ───────────────────────────────────────────────────

/// One pending restart at a time, gated by a cooldown.
///
/// `request` is refused while a restart is already pending or the
/// cooldown since the last fired restart has not elapsed, which bounds
/// restart storms no matter how often a trigger condition re-fires.
#[derive(Debug)]
pub struct RestartGovernor {
    cooldown_secs: u64,
    pending: Option<(u64, String)>,
    last_fired: Option<u64>,
}

impl RestartGovernor {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown_secs,
            pending: None,
            last_fired: None,
        }
    }

    pub fn request(&mut self, reason: &str, delay_secs: u64, now: u64) -> bool {
        if self.pending.is_some() {
            return false;
        }
        if let Some(last) = self.last_fired {
            if now.saturating_sub(last) < self.cooldown_secs {
                debug!(reason, "restart refused: within cooldown");
                return false;
            }
        }
        self.pending = Some((now.saturating_add(delay_secs), reason.to_string()));
        true
    }

    /// Schedule regardless of cooldown (backend switch, resume). Still one
    /// slot: a pending restart is never replaced.
    pub fn request_forced(&mut self, reason: &str, delay_secs: u64, now: u64) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some((now.saturating_add(delay_secs), reason.to_string()));
        true
    }

    pub fn due(&mut self, now: u64) -> Option<String> {
        match &self.pending {
            Some((due_at, _)) if *due_at <= now => {
                let (_, reason) = self.pending.take()?;
                self.last_fired = Some(now);
                Some(reason)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        if let Some((_, reason)) = self.pending.take() {
            debug!(reason, "pending restart cancelled");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Restartable-error counting with a lower threshold before the worker
/// has ever succeeded and a higher one afterward.
#[derive(Debug)]
pub struct ErrorTally {
    threshold_initial: u32,
    threshold_steady: u32,
    count: u32,
    had_success: bool,
}

impl ErrorTally {
    pub fn new(threshold_initial: u32, threshold_steady: u32) -> Self {
        Self {
            threshold_initial: threshold_initial.max(1),
            threshold_steady: threshold_steady.max(1),
            count: 0,
            had_success: false,
        }
    }

    /// Returns true when the applicable threshold is crossed; the count
    /// resets so each crossing triggers at most one restart request.
    pub fn record_error(&mut self) -> bool {
        self.count += 1;
        let threshold = if self.had_success {
            self.threshold_steady
        } else {
            self.threshold_initial
        };
        if self.count >= threshold {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.count = 0;
        self.had_success = true;
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────

pub struct Supervisor {
    config: VigilConfig,
    config_path: PathBuf,
    keymgr: Arc<KeyManager>,
    state: SupState,
    user_stopped: bool,
    paused: bool,
    worker: Option<WorkerProcess>,
    unlock: Option<UnlockChannel>,
    /// Unwrapped key for the current session; needed to enable autostart
    session_key: Option<DataKey>,
    tracker: StatusTracker,
    coalescer: DuplicateCoalescer,
    errors: ErrorTally,
    backend_faults: u32,
    governor: RestartGovernor,
    switch_reason: Option<String>,
    autostart_session: bool,
    events_tx: mpsc::Sender<Event>,
}

impl Supervisor {
    pub fn new(
        config: VigilConfig,
        config_path: PathBuf,
        keymgr: Arc<KeyManager>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        let capture = &config.capture;
        Self {
            coalescer: DuplicateCoalescer::new(
                capture.duplicate_log_min,
                capture.duplicate_log_window_secs,
            ),
            errors: ErrorTally::new(
                capture.error_threshold_initial,
                capture.error_threshold_steady,
            ),
            governor: RestartGovernor::new(capture.restart_cooldown_secs),
            config_path,
            keymgr,
            state: SupState::Locked,
            user_stopped: false,
            paused: false,
            worker: None,
            unlock: None,
            session_key: None,
            tracker: StatusTracker::new(),
            backend_faults: 0,
            switch_reason: None,
            autostart_session: false,
            events_tx,
            config,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) -> anyhow::Result<()> {
        self.boot().await;

        let mut poll = tokio::time::interval(Duration::from_secs(
            self.config.capture.status_poll_secs.max(1),
        ));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = poll.tick() => self.tick().await,
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Decide the initial state: autostart credential present means an
    /// unattended session; otherwise wait locked for a passphrase.
    async fn boot(&mut self) {
        if let Err(e) = self.keymgr.store().ensure_dirs() {
            error!("data directory unavailable: {e}");
        }

        if !self.keymgr.is_protected() {
            info!("no key protection yet; waiting for setup");
            self.state = SupState::Locked;
            return;
        }

        match self.keymgr.autostart_key() {
            Ok(Some(key)) => {
                info!("autostart credential found; starting unattended session");
                self.autostart_session = true;
                self.session_key = Some(DataKey::from_bytes(*key.as_bytes()));
                self.open_channel(KeySource::Raw(key)).await;
                if self.unlock.is_some() {
                    self.state = SupState::Stopped;
                    if let Err(e) = self.start_worker().await {
                        error!("autostart worker launch failed: {e}");
                    }
                }
            }
            Ok(None) => {
                info!("key protected; waiting for passphrase");
                self.state = SupState::Locked;
            }
            Err(e) => {
                warn!("autostart lookup failed: {e}");
                self.state = SupState::Locked;
            }
        }
    }

    // ── command handling ─────────────────────────────────────────────────

    /// Returns true on shutdown.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(resp) => {
                self.user_stopped = false;
                let reply = match self.start_worker().await {
                    Ok(outcome) => ok_reply(json!({ "outcome": outcome })),
                    Err(e) => error_reply(&e.to_string()),
                };
                let _ = resp.send(reply);
            }
            Command::Stop(resp) => {
                self.stop_worker(true).await;
                let _ = resp.send(ok_reply(json!({ "outcome": "stopped" })));
            }
            Command::Status(resp) => {
                let _ = resp.send(self.status_reply());
            }
            Command::KillStray(resp) => {
                let exclude: Vec<u32> = self.worker.iter().map(|w| w.pid()).collect();
                let count = process::kill_strays(&self.config.capture, &exclude);
                let _ = resp.send(ok_reply(json!({ "killed": count })));
            }
            Command::GetPrefs(resp) => {
                let prefs = serde_json::to_value(&self.config.capture)
                    .unwrap_or_else(|_| json!({}));
                let _ = resp.send(ok_reply(json!({ "prefs": prefs })));
            }
            Command::SetPrefs(patch, resp) => {
                let _ = resp.send(self.apply_prefs(patch));
            }
            Command::CreateProtection(passphrase, resp) => {
                self.create_protection(passphrase, resp);
            }
            Command::SubmitPassphrase(passphrase, resp) => {
                self.submit_passphrase(passphrase, resp);
            }
            Command::ChangePassphrase {
                old,
                new,
                use_recovery,
                resp,
            } => {
                self.change_passphrase(old, new, use_recovery, resp);
            }
            Command::LockInfo(resp) => {
                let _ = resp.send(self.lock_info_reply());
            }
            Command::SetAutostart(enabled, resp) => {
                let reply = match self.set_autostart(enabled) {
                    Ok(()) => ok_reply(json!({ "autostart": enabled })),
                    Err(e) => error_reply(&e.to_string()),
                };
                let _ = resp.send(reply);
            }
            Command::Power(event, resp) => {
                self.handle_power(event).await;
                let _ = resp.send(ok_reply(json!({ "state": self.state.as_str() })));
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Unlocked { passphrase, key } => {
                info!("session unlocked");
                self.session_key = Some(key);
                self.open_channel(KeySource::Passphrase {
                    passphrase,
                    manager: self.keymgr.clone(),
                })
                .await;
                if self.unlock.is_some() {
                    self.state = SupState::Stopped;
                } else {
                    self.state = SupState::Locked;
                }
            }
            Event::UnlockFailed => {
                if self.state == SupState::Unlocking {
                    self.state = SupState::Locked;
                }
            }
            Event::Rotated { passphrase, key } => {
                // The channel is recreated whenever the secret changes.
                info!("secret rotated; rebuilding unlock channel");
                self.session_key = Some(key);
                self.open_channel(KeySource::Passphrase {
                    passphrase,
                    manager: self.keymgr.clone(),
                })
                .await;
                if self.unlock.is_some() && self.state == SupState::Locked {
                    self.state = SupState::Stopped;
                }
            }
        }
    }

    // ── key operations (blocking, off the event loop) ────────────────────

    fn create_protection(&mut self, passphrase: SecretString, resp: oneshot::Sender<Value>) {
        if self.keymgr.is_protected() {
            let _ = resp.send(error_reply(
                "already protected; use change_passphrase instead",
            ));
            return;
        }
        self.state = SupState::Unlocking;
        let keymgr = self.keymgr.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mgr = keymgr.clone();
            let pass = passphrase.clone();
            let result = tokio::task::spawn_blocking(move || {
                let token = mgr.create(&pass)?;
                let key = mgr.validate(&pass)?;
                Ok::<_, VigilError>((token, key))
            })
            .await;
            match result {
                Ok(Ok((token, key))) => {
                    let _ = resp.send(ok_reply(json!({ "recovery_token": token })));
                    let _ = events.send(Event::Unlocked { passphrase, key }).await;
                }
                Ok(Err(e)) => {
                    let _ = resp.send(error_reply(&e.to_string()));
                    let _ = events.send(Event::UnlockFailed).await;
                }
                Err(e) => {
                    let _ = resp.send(error_reply(&format!("key setup task failed: {e}")));
                    let _ = events.send(Event::UnlockFailed).await;
                }
            }
        });
    }

    fn submit_passphrase(&mut self, passphrase: SecretString, resp: oneshot::Sender<Value>) {
        if !self.keymgr.is_protected() {
            let _ = resp.send(error_reply("key protection not initialized"));
            return;
        }
        self.state = SupState::Unlocking;
        let keymgr = self.keymgr.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mgr = keymgr.clone();
            let pass = passphrase.clone();
            let result = tokio::task::spawn_blocking(move || mgr.validate(&pass)).await;
            match result {
                Ok(Ok(key)) => {
                    let _ = resp.send(ok_reply(json!({ "unlocked": true })));
                    let _ = events.send(Event::Unlocked { passphrase, key }).await;
                }
                Ok(Err(e)) => {
                    let reply = failed_attempt_reply(&keymgr, &e);
                    let _ = resp.send(reply);
                    let _ = events.send(Event::UnlockFailed).await;
                }
                Err(e) => {
                    let _ = resp.send(error_reply(&format!("unlock task failed: {e}")));
                    let _ = events.send(Event::UnlockFailed).await;
                }
            }
        });
    }

    fn change_passphrase(
        &mut self,
        old: SecretString,
        new: SecretString,
        use_recovery: bool,
        resp: oneshot::Sender<Value>,
    ) {
        let keymgr = self.keymgr.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mgr = keymgr.clone();
            let new_for_task = new.clone();
            let result = tokio::task::spawn_blocking(move || {
                let token = mgr.change(&old, &new_for_task, use_recovery)?;
                let key = mgr.validate(&new_for_task)?;
                Ok::<_, VigilError>((token, key))
            })
            .await;
            match result {
                Ok(Ok((token, key))) => {
                    let _ = resp.send(ok_reply(json!({ "recovery_token": token })));
                    let _ = events
                        .send(Event::Rotated {
                            passphrase: new,
                            key,
                        })
                        .await;
                }
                Ok(Err(e)) => {
                    let _ = resp.send(failed_attempt_reply(&keymgr, &e));
                }
                Err(e) => {
                    let _ = resp.send(error_reply(&format!("change task failed: {e}")));
                }
            }
        });
    }

    fn set_autostart(&mut self, enabled: bool) -> Result<(), VigilError> {
        if enabled {
            let key = self.session_key.as_ref().ok_or_else(|| {
                VigilError::Config("enabling autostart requires an unlocked session".into())
            })?;
            self.keymgr.set_autostart_enabled(true, Some(key))
        } else {
            self.keymgr.set_autostart_enabled(false, None)
        }
    }

    // ── worker lifecycle ─────────────────────────────────────────────────

    /// Start gating per policy: deferred while locked, suppressed during a
    /// user stop, idempotent while spawning or alive.
    async fn start_worker(&mut self) -> Result<&'static str, VigilError> {
        match self.state {
            SupState::Locked | SupState::Unlocking => return Ok("deferred: locked"),
            SupState::Starting => return Ok("already starting"),
            _ => {}
        }
        if self.user_stopped {
            return Ok("suppressed: stopped by user");
        }
        if let Some(worker) = &self.worker {
            // OS-level liveness, not just the recorded pid
            if process::pid_alive(worker.pid()) {
                return Ok("already running");
            }
            self.worker = None;
        }
        if self.unlock.is_none() {
            return Ok("deferred: no unlock channel");
        }

        self.state = SupState::Starting;
        process::kill_strays(&self.config.capture, &[]);

        let env = self.worker_env();
        match process::spawn_worker(&self.config.capture, &env) {
            Ok(worker) => {
                self.tracker.reset();
                self.worker = Some(worker);
                self.paused = false;
                self.state = SupState::Running;
                Ok("started")
            }
            Err(e) => {
                self.state = SupState::Stopped;
                Err(e)
            }
        }
    }

    async fn stop_worker(&mut self, user: bool) {
        if user {
            self.user_stopped = true;
            self.governor.cancel();
        }
        if let Some(summary) = self.coalescer.flush(now_epoch()) {
            log_duplicate_summary(&summary);
        }
        if let Some(worker) = self.worker.take() {
            self.state = SupState::Stopping;
            worker
                .stop(Duration::from_secs(self.config.capture.stop_grace_secs))
                .await;
        }
        if !matches!(self.state, SupState::Locked | SupState::Unlocking) {
            self.state = SupState::Stopped;
        }
    }

    async fn handle_power(&mut self, event: PowerEvent) {
        match event {
            PowerEvent::SessionLocked | PowerEvent::Suspend | PowerEvent::Shutdown => {
                if self.worker.is_some() {
                    info!(?event, "pausing worker for system event");
                    // Pause never flips the user-stop flag.
                    self.stop_worker(false).await;
                    self.state = SupState::Paused;
                }
                self.paused = true;
                self.governor.cancel();
            }
            PowerEvent::SessionUnlocked | PowerEvent::Resume => {
                if !self.paused {
                    return;
                }
                self.paused = false;
                if self.user_stopped {
                    debug!("resume ignored: user had stopped the worker");
                    self.state = SupState::Stopped;
                    return;
                }
                if self.state == SupState::Paused {
                    self.state = SupState::Stopped;
                }
                info!(
                    settle_secs = self.config.capture.resume_settle_secs,
                    "system resumed; restart scheduled"
                );
                self.governor.request_forced(
                    "system resume",
                    self.config.capture.resume_settle_secs,
                    now_epoch(),
                );
            }
        }
    }

    // ── polling ──────────────────────────────────────────────────────────

    async fn tick(&mut self) {
        let now = now_epoch();
        self.reap_worker(now);

        if self.state == SupState::Running {
            let status_path = self.keymgr.store().status_path();
            if let Some(record) = read_status_file(&status_path) {
                self.ingest_record(&record, now);
            }
            self.check_stall(now);
        }

        if let Some(reason) = self.governor.due(now) {
            if self.user_stopped || self.paused {
                debug!(reason, "scheduled restart dropped: user stop or pause");
            } else {
                info!(reason, "restarting worker");
                self.stop_worker(false).await;
                if let Err(e) = self.start_worker().await {
                    error!("scheduled restart failed: {e}");
                }
            }
        }
    }

    fn reap_worker(&mut self, now: u64) {
        let Some(worker) = &mut self.worker else {
            return;
        };
        match worker.try_wait() {
            Ok(Some(exit)) => {
                let pid = worker.pid();
                self.worker = None;
                if self.state == SupState::Running && !self.user_stopped && !self.paused {
                    warn!(pid, %exit, "worker exited unexpectedly");
                    self.state = SupState::Stopped;
                    self.governor.request("unexpected worker exit", 0, now);
                } else {
                    debug!(pid, %exit, "worker exited");
                    if self.state == SupState::Running {
                        self.state = SupState::Stopped;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("worker wait failed: {e}"),
        }
    }

    fn ingest_record(&mut self, record: &CaptureStatusRecord, now: u64) {
        match self.tracker.ingest(record, now) {
            Ingest::Stale(why) => {
                debug!(%why, "stale status record dropped");
            }
            Ingest::Accepted {
                advanced,
                regression,
            } => {
                if regression {
                    warn!(
                        instance = %record.instance_id,
                        capture_count = record.capture_count,
                        "capture count went backwards: possible second writer"
                    );
                    let exclude: Vec<u32> = self.worker.iter().map(|w| w.pid()).collect();
                    process::kill_strays(&self.config.capture, &exclude);
                }
                // The same record re-read on a later poll carries no new
                // information; only an advance feeds the accounting below.
                if !advanced {
                    return;
                }
                if let Some(summary) = self.coalescer.observe(record, now) {
                    log_duplicate_summary(&summary);
                }
                match record.error {
                    Some(kind) => self.note_error(kind, now),
                    None if record.capture_count > 0 => {
                        self.errors.record_success();
                        self.backend_faults = 0;
                    }
                    None => {}
                }
            }
        }
    }

    fn note_error(&mut self, kind: CaptureErrorKind, now: u64) {
        debug!(?kind, "worker reported error");

        if kind.indicates_backend_fault() {
            self.backend_faults += 1;
            if self.backend_faults >= self.config.capture.backend_switch_threshold {
                let from = self.config.capture.backend;
                let to = from.alternate();
                let reason = format!(
                    "{from} failed {} times ({kind:?})",
                    self.backend_faults
                );
                warn!(%from, %to, %reason, "switching capture backend");
                self.config.capture.backend = to;
                self.switch_reason = Some(reason);
                self.backend_faults = 0;
                self.persist_config();
                self.governor.request_forced("backend switch", 0, now);
                return;
            }
        }

        if kind.is_restartable() && self.errors.record_error() {
            self.governor.request("repeated capture errors", 0, now);
        }
    }

    fn check_stall(&mut self, now: u64) {
        let Some(worker) = &self.worker else { return };
        if self.governor.is_pending() {
            return;
        }
        if process::pid_alive(worker.pid())
            && self
                .tracker
                .stalled(now, self.config.capture.stall_window_secs)
        {
            warn!(
                pid = worker.pid(),
                window_secs = self.config.capture.stall_window_secs,
                "worker alive but sequence stalled; forcing restart"
            );
            self.governor.request("sequence stall", 0, now);
        }
    }

    // ── helpers ──────────────────────────────────────────────────────────

    async fn open_channel(&mut self, source: KeySource) {
        // Replacing an open channel retires its listener and token first;
        // otherwise the old accept task would serve for the whole session.
        if let Some(previous) = self.unlock.take() {
            previous.shutdown();
        }
        let path = self.keymgr.store().unlock_descriptor_path();
        match UnlockChannel::bind(path, source).await {
            Ok(channel) => self.unlock = Some(channel),
            Err(e) => error!("unlock channel failed to open: {e}"),
        }
    }

    fn worker_env(&self) -> Vec<(&'static str, String)> {
        let store = self.keymgr.store();
        let mut env = vec![
            (
                "VIGIL_FORCE_BACKEND",
                self.config.capture.backend.as_str().to_string(),
            ),
            (
                "VIGIL_UNLOCK_FILE",
                store.unlock_descriptor_path().display().to_string(),
            ),
            (
                "VIGIL_STATUS_FILE",
                store.status_path().display().to_string(),
            ),
            (
                "VIGIL_CAPTURE_INTERVAL_SECS",
                self.config.capture.interval_secs.to_string(),
            ),
            (
                "VIGIL_RETENTION_DAYS",
                self.config.capture.retention_days.to_string(),
            ),
        ];
        if let Some(reason) = &self.switch_reason {
            env.push(("VIGIL_BACKEND_SWITCH_REASON", reason.clone()));
        }
        if self.autostart_session {
            env.push(("VIGIL_AUTOSTART", "1".to_string()));
        }
        env
    }

    fn apply_prefs(&mut self, patch: Value) -> Value {
        if let Some(interval) = patch.get("interval_secs").and_then(Value::as_u64) {
            if interval == 0 {
                return error_reply("interval_secs must be positive");
            }
            self.config.capture.interval_secs = interval;
        }
        if let Some(backend) = patch.get("backend").and_then(Value::as_str) {
            match backend.parse() {
                Ok(backend) => {
                    self.config.capture.backend = backend;
                    // A user-chosen backend clears any automatic switch note.
                    self.switch_reason = None;
                    self.backend_faults = 0;
                }
                Err(e) => return error_reply(&e),
            }
        }
        if let Some(days) = patch.get("retention_days").and_then(Value::as_u64) {
            self.config.capture.retention_days = days as u32;
        }
        self.persist_config();

        if self.worker.is_some() {
            self.governor
                .request_forced("preferences changed", 0, now_epoch());
        }
        let prefs = serde_json::to_value(&self.config.capture).unwrap_or_else(|_| json!({}));
        ok_reply(json!({ "prefs": prefs }))
    }

    fn persist_config(&self) {
        let rendered = match toml::to_string_pretty(&self.config) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("config serialization failed: {e}");
                return;
            }
        };
        if let Some(parent) = self.config_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("config directory unavailable: {e}");
                return;
            }
        }
        if let Err(e) = atomic_write_restricted(&self.config_path, rendered.as_bytes()) {
            warn!(path = %self.config_path.display(), "config persist failed: {e}");
        } else {
            debug!(path = %self.config_path.display(), "config persisted");
        }
    }

    fn status_reply(&self) -> Value {
        ok_reply(json!({
            "state": self.state.as_str(),
            "protected": self.keymgr.is_protected(),
            "pid": self.worker.as_ref().map(|w| w.pid()),
            "backend": self.config.capture.backend.as_str(),
            "last_sequence": self.tracker.last_sequence(),
            "user_stopped": self.user_stopped,
            "paused": self.paused,
            "restart_pending": self.governor.is_pending(),
            "backend_switch_reason": self.switch_reason.clone(),
        }))
    }

    fn lock_info_reply(&self) -> Value {
        let state = self.keymgr.lock_info();
        let (locked, retry_after_secs) = match self.keymgr.lock_status() {
            LockStatus::Locked { remaining_secs } => (true, Some(remaining_secs)),
            LockStatus::Open => (false, None),
            LockStatus::Destroyed => (false, None),
        };
        ok_reply(json!({
            "fails": state.fails,
            "lock_until": state.lock_until,
            "reset": state.reset,
            "locked": locked,
            "retry_after_secs": retry_after_secs,
        }))
    }

    async fn teardown(&mut self) {
        info!("supervisor shutting down");
        self.stop_worker(false).await;
        if let Some(channel) = self.unlock.take() {
            channel.shutdown();
        }
    }
}

/// A genuine invalid-secret outcome advances the lockout schedule; other
/// failures are reported as-is.
fn failed_attempt_reply(keymgr: &KeyManager, err: &VigilError) -> Value {
    match err {
        VigilError::InvalidSecret => {
            match keymgr.record_failure() {
                Ok((state, _)) => {
                    let mut value = error_reply("invalid secret");
                    value["fails"] = json!(state.fails);
                    value["lock_until"] = json!(state.lock_until);
                    value["reset"] = json!(state.reset);
                    value
                }
                Err(e) => error_reply(&format!("invalid secret (lockout update failed: {e})")),
            }
        }
        other => error_reply(&other.to_string()),
    }
}

fn log_duplicate_summary(summary: &crate::status::DuplicateSummary) {
    info!(
        count = summary.count,
        window_secs = summary.window_secs,
        window_title = summary.window_title.as_deref().unwrap_or("<unknown>"),
        "duplicate frames suppressed"
    );
}

fn ok_reply(mut extra: Value) -> Value {
    extra["status"] = json!("ok");
    extra
}

fn error_reply(msg: &str) -> Value {
    json!({ "status": "error", "msg": msg })
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
