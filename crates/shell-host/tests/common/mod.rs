//! Reusable test harness for shell-host integration tests.
//!
//! Provides helpers for spawning the server binary against stub shell
//! commands, connecting over WebSocket, and sending/receiving the JSON
//! control messages and raw output frames.

use std::fs;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Server handle ───────────────────────────────────────────────────

/// Handle to a running server process. Kills it on drop.
pub struct ServerHandle {
    child: Child,
    pub addr: String,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Write an executable stub script that stands in for the `ssh` command.
pub fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write stub script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod stub script");
    path
}

/// Spawn the server binary on an ephemeral port and wait for its startup
/// line to learn the bound address.
pub fn spawn_server(ssh_command: &Path, extra_args: &[&str]) -> ServerHandle {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_webshell-host"));
    cmd.arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--ssh-command")
        .arg(ssh_command)
        .args(extra_args)
        .env("RUST_LOG", "webshell_host=info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().expect("spawn server binary");

    let stdout = child.stdout.take().expect("server stdout");
    let mut reader = BufReader::new(stdout);
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut addr = None;
    let mut line = String::new();
    while Instant::now() < deadline {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if let Some(idx) = line.find("listening on ") {
                    // The log line may carry ANSI codes; keep only address chars.
                    let tail = &line[idx + "listening on ".len()..];
                    let parsed: String = tail
                        .chars()
                        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ':')
                        .collect();
                    if !parsed.is_empty() {
                        addr = Some(parsed);
                        break;
                    }
                }
            }
        }
    }
    let addr = addr.expect("server did not report a listen address");

    // Keep draining stdout so the server never blocks on a full pipe.
    std::thread::spawn(move || {
        let mut sink = String::new();
        while let Ok(n) = reader.read_line(&mut sink) {
            if n == 0 {
                break;
            }
            sink.clear();
        }
    });

    ServerHandle { child, addr }
}

// ── WebSocket client helpers ────────────────────────────────────────

pub async fn ws_connect(addr: &str, path: &str) -> WsClient {
    try_ws_connect(addr, path).await.expect("websocket connect")
}

pub async fn try_ws_connect(
    addr: &str,
    path: &str,
) -> Result<WsClient, tokio_tungstenite::tungstenite::Error> {
    let (ws, _response) = connect_async(format!("ws://{addr}{path}")).await?;
    Ok(ws)
}

pub async fn send_input(ws: &mut WsClient, input: &str) {
    let msg = serde_json::json!({ "input": input }).to_string();
    ws.send(Message::Text(msg)).await.expect("send input frame");
}

pub async fn send_resize(ws: &mut WsClient, cols: u16, rows: u16) {
    let msg = serde_json::json!({ "resize": { "cols": cols, "rows": rows } }).to_string();
    ws.send(Message::Text(msg)).await.expect("send resize frame");
}

pub async fn send_raw(ws: &mut WsClient, raw: &str) {
    ws.send(Message::Text(raw.to_string()))
        .await
        .expect("send raw frame");
}

/// Accumulate binary output until `needle` appears or the timeout elapses.
pub async fn collect_until(ws: &mut WsClient, needle: &str, timeout: Duration) -> String {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut out = String::new();
    loop {
        if out.contains(needle) {
            return out;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return out;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => {
                out.push_str(&String::from_utf8_lossy(&data));
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return out,
            Err(_) => return out,
        }
    }
}

/// True if the server closes the connection within the timeout.
pub async fn closed_within(ws: &mut WsClient, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}
