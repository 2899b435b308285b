//! Loopback unlock channel: hands the unwrapped data key to the worker.
//!
//! Binds an ephemeral port on 127.0.0.1 and advertises it through a
//! 0600 descriptor file `{host, port, token}`. Requests are single-line
//! JSON `{token, action:"get_key"}`; the reply is `{status:"ok", key_b64}`
//! on success. Every failure — bad JSON, wrong token, wrong action, an
//! unwrap failure — produces the same byte-identical error line so the
//! channel cannot be used as an oracle for which part was wrong.
//!
//! The listener outlives worker restarts within one supervisor session; a
//! crashed worker re-fetches the key without a new prompt. It is torn down
//! and rebuilt on passphrase rotation.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use vigil_crypto::DataKey;
use vigil_keymgr::manager::{generate_token, tokens_match};
use vigil_keymgr::KeyManager;
use vigil_keymgr::store::atomic_write_restricted;

/// Single error line for every rejection; no variation, no oracle.
const ERROR_LINE: &[u8] = b"{\"status\":\"error\",\"msg\":\"invalid request\"}\n";

/// Where the channel gets the key it serves.
pub enum KeySource {
    /// The data key itself, already unwrapped (autostart sessions).
    Raw(DataKey),
    /// The passphrase; each request runs a fresh unwrap so the plaintext
    /// key is produced just-in-time and never cached.
    Passphrase {
        passphrase: SecretString,
        manager: Arc<KeyManager>,
    },
}

#[derive(Serialize, Deserialize)]
struct UnlockDescriptor {
    host: String,
    port: u16,
    token: String,
}

#[derive(Deserialize)]
struct UnlockRequest {
    #[serde(default)]
    token: String,
    #[serde(default)]
    action: String,
}

#[derive(Serialize)]
struct UnlockOk<'a> {
    status: &'static str,
    key_b64: &'a str,
}

pub struct UnlockChannel {
    port: u16,
    descriptor_path: PathBuf,
    accept_task: tokio::task::JoinHandle<()>,
}

impl UnlockChannel {
    /// Bind 127.0.0.1:0, write the descriptor, start serving.
    pub async fn bind(descriptor_path: PathBuf, source: KeySource) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("binding unlock channel")?;
        let port = listener.local_addr()?.port();
        let token = generate_token();

        let descriptor = UnlockDescriptor {
            host: "127.0.0.1".into(),
            port,
            token: token.clone(),
        };
        let bytes = serde_json::to_vec(&descriptor)?;
        atomic_write_restricted(&descriptor_path, &bytes)
            .context("writing unlock descriptor")?;

        debug!(port, "unlock channel listening");

        let source = Arc::new(source);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let source = source.clone();
                        let token = token.clone();
                        // Each connection gets its own buffer; a lingering
                        // old worker and a fresh one can overlap safely.
                        tokio::spawn(async move {
                            serve_connection(stream, &token, &source).await;
                        });
                    }
                    Err(e) => {
                        warn!("unlock channel accept failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            port,
            descriptor_path,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving and remove the descriptor.
    pub fn shutdown(self) {
        self.accept_task.abort();
        match std::fs::remove_file(&self.descriptor_path) {
            Ok(()) | Err(_) => {}
        }
        debug!(port = self.port, "unlock channel closed");
    }
}

async fn serve_connection(stream: TcpStream, token: &str, source: &KeySource) {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    if BufReader::new(read_half).read_line(&mut line).await.is_err() {
        return;
    }

    let reply = if authorize(&line, token) {
        match produce_key(source).await {
            Some(key) => {
                let key_b64 = B64.encode(key.as_bytes());
                let ok = UnlockOk {
                    status: "ok",
                    key_b64: &key_b64,
                };
                match serde_json::to_vec(&ok) {
                    Ok(mut bytes) => {
                        bytes.push(b'\n');
                        bytes
                    }
                    Err(_) => ERROR_LINE.to_vec(),
                }
            }
            None => ERROR_LINE.to_vec(),
        }
    } else {
        ERROR_LINE.to_vec()
    };

    if let Err(e) = write_half.write_all(&reply).await {
        debug!("unlock channel reply failed: {e}");
    }
    let _ = write_half.shutdown().await;
}

/// Token and action are validated as one decision; the caller learns only
/// pass/fail.
fn authorize(line: &str, token: &str) -> bool {
    match serde_json::from_str::<UnlockRequest>(line.trim()) {
        Ok(req) => tokens_match(&req.token, token) && req.action == "get_key",
        Err(_) => false,
    }
}

async fn produce_key(source: &KeySource) -> Option<DataKey> {
    match source {
        KeySource::Raw(key) => Some(DataKey::from_bytes(*key.as_bytes())),
        KeySource::Passphrase {
            passphrase,
            manager,
        } => {
            let passphrase = passphrase.clone();
            let manager = manager.clone();
            // KDF work stays off the async threads.
            match tokio::task::spawn_blocking(move || manager.validate(&passphrase)).await {
                Ok(Ok(key)) => Some(key),
                Ok(Err(e)) => {
                    warn!("unlock channel key production failed: {e}");
                    None
                }
                Err(e) => {
                    warn!("unlock channel unwrap task failed: {e}");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use vigil_crypto::generate_data_key;

    async fn request(port: u16, body: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(body.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    fn read_token(path: &std::path::Path) -> String {
        let desc: UnlockDescriptor =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        desc.token
    }

    #[tokio::test]
    async fn test_raw_mode_serves_key() {
        let dir = tempfile::tempdir().unwrap();
        let desc_path = dir.path().join("unlock.json");
        let key = generate_data_key();
        let expected = B64.encode(key.as_bytes());

        let channel = UnlockChannel::bind(desc_path.clone(), KeySource::Raw(key))
            .await
            .unwrap();
        let token = read_token(&desc_path);

        let reply = request(
            channel.port(),
            &format!(r#"{{"token":"{token}","action":"get_key"}}"#),
        )
        .await;
        let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["key_b64"], expected);

        channel.shutdown();
        assert!(!desc_path.exists(), "descriptor removed on teardown");
    }

    #[tokio::test]
    async fn test_no_oracle_between_failure_modes() {
        let dir = tempfile::tempdir().unwrap();
        let desc_path = dir.path().join("unlock.json");
        let channel = UnlockChannel::bind(desc_path.clone(), KeySource::Raw(generate_data_key()))
            .await
            .unwrap();
        let token = read_token(&desc_path);
        let port = channel.port();

        let wrong_token =
            request(port, r#"{"token":"never-issued","action":"get_key"}"#).await;
        let wrong_action = request(
            port,
            &format!(r#"{{"token":"{token}","action":"get_keys"}}"#),
        )
        .await;
        let malformed = request(port, "{not json").await;

        assert_eq!(wrong_token, wrong_action, "identical error shape required");
        assert_eq!(wrong_token, malformed);
        assert_eq!(
            wrong_token,
            String::from_utf8(ERROR_LINE.to_vec()).unwrap()
        );

        channel.shutdown();
    }

    #[tokio::test]
    async fn test_channel_survives_repeated_fetches() {
        // A restarted worker re-fetches without the channel being rebuilt.
        let dir = tempfile::tempdir().unwrap();
        let desc_path = dir.path().join("unlock.json");
        let channel = UnlockChannel::bind(desc_path.clone(), KeySource::Raw(generate_data_key()))
            .await
            .unwrap();
        let token = read_token(&desc_path);

        for _ in 0..3 {
            let reply = request(
                channel.port(),
                &format!(r#"{{"token":"{token}","action":"get_key"}}"#),
            )
            .await;
            assert!(reply.contains(r#""status":"ok""#));
        }
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_passphrase_mode_unwraps_per_request() {
        use vigil_core::config::LockoutConfig;
        use vigil_keymgr::{Keychain, KeyStore, LockoutPolicy};

        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let keychain = Keychain::fallback_only(store.keychain_fallback_path());
        let policy = LockoutPolicy::from_config(&LockoutConfig::default());
        let manager = Arc::new(KeyManager::from_parts(store, keychain, policy, 1_000));

        let pass = SecretString::from("Chan-Test-11!a");
        manager.create(&pass).unwrap();
        let expected = B64.encode(manager.validate(&pass).unwrap().as_bytes());

        let desc_path = dir.path().join("unlock.json");
        let channel = UnlockChannel::bind(
            desc_path.clone(),
            KeySource::Passphrase {
                passphrase: pass,
                manager,
            },
        )
        .await
        .unwrap();
        let token = read_token(&desc_path);

        let reply = request(
            channel.port(),
            &format!(r#"{{"token":"{token}","action":"get_key"}}"#),
        )
        .await;
        let parsed: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["key_b64"], expected);

        channel.shutdown();
    }
}
