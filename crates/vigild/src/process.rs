//! Worker process control: spawn, liveness, graceful termination, and
//! stray-process hygiene.
//!
//! Liveness is checked against the OS process table (`sysinfo`), not just
//! a recorded pid, so a worker that died without the supervisor noticing
//! is never counted as alive. Stray same-role processes are terminated
//! before every spawn to guarantee single-writer semantics on the status
//! file.

use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use vigil_core::config::CaptureConfig;
use vigil_core::{VigilError, VigilResult};

#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: u32,
}

impl WorkerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// SIGTERM, wait out the grace window, then SIGKILL.
    pub async fn stop(mut self, grace: Duration) {
        let pid = self.pid;
        terminate_pid(pid);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, %status, "worker exited after SIGTERM");
            }
            Ok(Err(e)) => warn!(pid, "waiting for worker exit: {e}"),
            Err(_) => {
                warn!(pid, grace_secs = grace.as_secs(), "worker ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(pid, "kill failed: {e}");
                }
            }
        }
    }
}

/// Spawn the capture worker with the configured command line plus
/// supervisor-provided environment overrides.
pub fn spawn_worker(
    cfg: &CaptureConfig,
    env: &[(&str, String)],
) -> VigilResult<WorkerProcess> {
    let mut command = Command::new(&cfg.worker_command);
    command.args(&cfg.worker_args);
    for (key, value) in env {
        command.env(key, value);
    }
    command.kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| VigilError::Spawn(format!("{}: {e}", cfg.worker_command.display())))?;
    let pid = child
        .id()
        .ok_or_else(|| VigilError::Spawn("worker exited before pid was known".into()))?;

    info!(pid, command = %cfg.worker_command.display(), "worker spawned");
    Ok(WorkerProcess { child, pid })
}

/// Whether a pid still exists in the OS process table.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from_u32(pid))
}

fn terminate_pid(pid: u32) {
    let mut sys = System::new();
    if sys.refresh_process(Pid::from_u32(pid)) {
        if let Some(process) = sys.process(Pid::from_u32(pid)) {
            process.kill_with(Signal::Term);
        }
    }
}

/// Pids of other processes running the same worker executable.
pub fn find_strays(cfg: &CaptureConfig, exclude: &[u32]) -> Vec<u32> {
    let worker_name = match cfg.worker_command.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Vec::new(),
    };
    let own_pid = std::process::id();

    let mut sys = System::new();
    sys.refresh_processes();
    sys.processes()
        .iter()
        .filter(|(pid, process)| {
            let pid = pid.as_u32();
            pid != own_pid && !exclude.contains(&pid) && process.name() == worker_name
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Terminate stray workers: graceful signal inline, forced kill for any
/// survivor after the grace window on a background task, so the caller
/// never waits out the window. Returns how many were found.
///
/// Must run inside a tokio runtime when strays exist.
pub fn kill_strays(cfg: &CaptureConfig, exclude: &[u32]) -> usize {
    let strays = find_strays(cfg, exclude);
    if strays.is_empty() {
        return 0;
    }
    warn!(count = strays.len(), pids = ?strays, "terminating stray workers");

    for &pid in &strays {
        terminate_pid(pid);
    }

    let grace = cfg.stop_grace_secs;
    let signalled = strays.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(grace)).await;
        let mut sys = System::new();
        for pid in signalled {
            if sys.refresh_process(Pid::from_u32(pid)) {
                if let Some(process) = sys.process(Pid::from_u32(pid)) {
                    warn!(pid, "stray worker survived SIGTERM, killing");
                    process.kill();
                }
            }
        }
    });
    strays.len()
}
