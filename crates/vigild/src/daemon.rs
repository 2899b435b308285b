//! Daemon lifecycle: wiring, control socket, signals, systemd notify

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use vigil_core::config::VigilConfig;
use vigil_keymgr::KeyManager;

use crate::control;
use crate::supervisor::{Command, Supervisor};

pub async fn run(mut config: VigilConfig, config_path: PathBuf) -> Result<()> {
    config.daemon.data_dir = expand_home(&config.daemon.data_dir);
    config.daemon.control_socket = expand_home(&config.daemon.control_socket);

    let keymgr = Arc::new(KeyManager::new(&config));
    keymgr
        .store()
        .ensure_dirs()
        .context("preparing data directory")?;
    info!(
        data_dir = %config.daemon.data_dir.display(),
        protected = keymgr.is_protected(),
        "key store ready"
    );

    let (commands_tx, commands_rx) = mpsc::channel::<Command>(32);
    let (events_tx, events_rx) = mpsc::channel(8);

    let supervisor = Supervisor::new(config.clone(), config_path, keymgr, events_tx);
    let supervisor_task = tokio::spawn(supervisor.run(commands_rx, events_rx));

    let socket_path = config.daemon.control_socket.clone();
    let control_commands = commands_tx.clone();
    let control_task = tokio::spawn(async move {
        if let Err(e) = control::serve(&socket_path, control_commands).await {
            error!("control socket failed: {e}");
        }
    });

    notify_ready();

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    // Graceful shutdown: the supervisor stops the worker and tears down
    // the unlock channel before the task resolves.
    let _ = commands_tx.send(Command::Shutdown).await;
    let _ = supervisor_task.await;
    control_task.abort();
    let _ = std::fs::remove_file(&config.daemon.control_socket);

    info!("vigild exiting cleanly");
    Ok(())
}

/// Expand a leading `~/` against $HOME; the config default lives under the
/// user's data directory.
fn expand_home(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
