//! Control socket: newline-delimited JSON over a Unix domain socket.
//!
//! The UI layer connects here for everything: worker lifecycle, key
//! operations, preferences, and power-event delivery. Each request is one
//! JSON line `{"op": ..., ...}`; each reply is one JSON line with
//! `status: "ok" | "error"`. Requests are translated into supervisor
//! commands and answered in order per connection.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::supervisor::Command;

#[derive(Deserialize)]
struct ControlRequest {
    op: String,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    old: Option<String>,
    #[serde(default)]
    new: Option<String>,
    #[serde(default)]
    use_recovery: bool,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    prefs: Option<Value>,
}

/// Bind the control socket and serve until the command channel closes.
pub async fn serve(socket_path: &Path, commands: mpsc::Sender<Command>) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "control socket listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let commands = commands.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, commands).await {
                        debug!("control connection ended: {e}");
                    }
                });
            }
            Err(e) => {
                warn!("control socket accept failed: {e}");
                return Err(e.into());
            }
        }
    }
}

async fn serve_connection(stream: UnixStream, commands: mpsc::Sender<Command>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatch(&line, &commands).await;
        let mut bytes = serde_json::to_vec(&reply)?;
        bytes.push(b'\n');
        write_half.write_all(&bytes).await?;
    }
    Ok(())
}

async fn dispatch(line: &str, commands: &mpsc::Sender<Command>) -> Value {
    let request: ControlRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return error_reply(&format!("malformed request: {e}")),
    };

    let (tx, rx) = oneshot::channel();
    let command = match build_command(request, tx) {
        Ok(command) => command,
        Err(msg) => return error_reply(&msg),
    };

    if commands.send(command).await.is_err() {
        return error_reply("daemon is shutting down");
    }
    match rx.await {
        Ok(reply) => reply,
        Err(_) => error_reply("daemon is shutting down"),
    }
}

fn build_command(
    request: ControlRequest,
    resp: oneshot::Sender<Value>,
) -> Result<Command, String> {
    let secret = |field: Option<String>, name: &str| {
        field
            .map(SecretString::from)
            .ok_or_else(|| format!("{name} required"))
    };

    match request.op.as_str() {
        "start" => Ok(Command::Start(resp)),
        "stop" => Ok(Command::Stop(resp)),
        "status" => Ok(Command::Status(resp)),
        "kill_stray" => Ok(Command::KillStray(resp)),
        "get_prefs" => Ok(Command::GetPrefs(resp)),
        "set_prefs" => {
            let prefs = request.prefs.ok_or("prefs object required")?;
            Ok(Command::SetPrefs(prefs, resp))
        }
        "create_protection" => Ok(Command::CreateProtection(
            secret(request.passphrase, "passphrase")?,
            resp,
        )),
        "submit_passphrase" => Ok(Command::SubmitPassphrase(
            secret(request.passphrase, "passphrase")?,
            resp,
        )),
        "change_passphrase" => Ok(Command::ChangePassphrase {
            old: secret(request.old, "old")?,
            new: secret(request.new, "new")?,
            use_recovery: request.use_recovery,
            resp,
        }),
        "lock_info" => Ok(Command::LockInfo(resp)),
        "set_autostart" => {
            let enabled = request.enabled.ok_or("enabled required")?;
            Ok(Command::SetAutostart(enabled, resp))
        }
        "power_event" => {
            let event = request.event.ok_or("event required")?;
            let event: crate::supervisor::PowerEvent = event.parse()?;
            Ok(Command::Power(event, resp))
        }
        other => Err(format!("unknown op: {other}")),
    }
}

fn error_reply(msg: &str) -> Value {
    json!({ "status": "error", "msg": msg })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::PowerEvent;

    /// Answers every command with a canned reply so the wire layer can be
    /// tested without a full supervisor.
    fn echo_supervisor() -> mpsc::Sender<Command> {
        let (tx, mut rx) = mpsc::channel::<Command>(8);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Status(resp) => {
                        let _ = resp.send(json!({ "status": "ok", "state": "stopped" }));
                    }
                    Command::Power(event, resp) => {
                        assert_eq!(event, PowerEvent::Suspend);
                        let _ = resp.send(json!({ "status": "ok" }));
                    }
                    Command::SubmitPassphrase(pass, resp) => {
                        use secrecy::ExposeSecret;
                        assert_eq!(pass.expose_secret(), "hunter2hunter2");
                        let _ = resp.send(json!({ "status": "ok", "unlocked": true }));
                    }
                    _ => panic!("unexpected command"),
                }
            }
        });
        tx
    }

    async fn roundtrip(socket: &Path, request: &str) -> Value {
        let stream = UnixStream::connect(socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(request.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn start_server() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("vigild.sock");
        let commands = echo_supervisor();
        let server_socket = socket.clone();
        tokio::spawn(async move {
            let _ = serve(&server_socket, commands).await;
        });
        // Wait for the bind
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        (dir, socket)
    }

    #[tokio::test]
    async fn test_status_roundtrip() {
        let (_dir, socket) = start_server().await;
        let reply = roundtrip(&socket, r#"{"op":"status"}"#).await;
        assert_eq!(reply["status"], "ok");
        assert_eq!(reply["state"], "stopped");
    }

    #[tokio::test]
    async fn test_power_event_parsed() {
        let (_dir, socket) = start_server().await;
        let reply = roundtrip(&socket, r#"{"op":"power_event","event":"suspend"}"#).await;
        assert_eq!(reply["status"], "ok");
    }

    #[tokio::test]
    async fn test_passphrase_carried() {
        let (_dir, socket) = start_server().await;
        let reply = roundtrip(
            &socket,
            r#"{"op":"submit_passphrase","passphrase":"hunter2hunter2"}"#,
        )
        .await;
        assert_eq!(reply["unlocked"], true);
    }

    #[tokio::test]
    async fn test_unknown_op_rejected() {
        let (_dir, socket) = start_server().await;
        let reply = roundtrip(&socket, r#"{"op":"frobnicate"}"#).await;
        assert_eq!(reply["status"], "error");
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let (_dir, socket) = start_server().await;
        let reply = roundtrip(&socket, "{not json").await;
        assert_eq!(reply["status"], "error");
    }

    #[tokio::test]
    async fn test_missing_required_field_rejected() {
        let (_dir, socket) = start_server().await;
        let reply = roundtrip(&socket, r#"{"op":"submit_passphrase"}"#).await;
        assert_eq!(reply["status"], "error");
        assert!(reply["msg"].as_str().unwrap().contains("passphrase"));
    }
}
