//! WebKit inspector proxy supervision and debugger sessions.
//!
//! The proxy is a supervised subprocess exposing an HTTP target list and
//! per-target WebSocket debugger URLs. A session owns one socket: commands
//! carry monotonically increasing ids and responses are correlated back to
//! their waiters; closing the session fails every pending request with
//! CANCELLED.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{AutomationError, Result};

/// Inspector proxy configuration.
#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// Command spawned as the proxy (e.g. ios_webkit_debug_proxy).
    pub command: String,
    /// HTTP port serving the target list.
    pub port: u16,
    /// Per-command timeout on debugger sessions.
    pub command_timeout: Duration,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            command: "ios_webkit_debug_proxy".to_string(),
            port: 9221,
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// One inspectable page.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TargetInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: String,
}

/// Supervised inspector proxy process.
pub struct InspectorProxy {
    config: InspectorConfig,
    client: reqwest::Client,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl InspectorProxy {
    pub fn new(config: InspectorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self {
            config,
            client,
            child: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the proxy if it is not already running.
    pub async fn ensure_running(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => {
                    warn!("inspector proxy exited with {}; respawning", status);
                    *slot = None;
                }
                Err(err) => {
                    warn!("inspector proxy wait failed: {}; respawning", err);
                    *slot = None;
                }
            }
        }

        info!("spawning inspector proxy on port {}", self.config.port);
        let child = Command::new(&self.config.command)
            .arg("-c")
            .arg(format!("null:{},:{}", self.config.port, self.config.port + 1))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AutomationError::Process(format!("failed to spawn inspector proxy: {e}"))
            })?;
        *slot = Some(child);
        Ok(())
    }

    /// Fetch the target list.
    pub async fn list_targets(&self) -> Result<Vec<TargetInfo>> {
        self.ensure_running().await?;
        let url = format!("http://127.0.0.1:{}/json", self.config.port);
        let targets: Vec<TargetInfo> = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(targets)
    }

    /// Open a debugger session against one target.
    pub async fn open_session(&self, target: &TargetInfo) -> Result<InspectorSession> {
        if target.web_socket_debugger_url.is_empty() {
            return Err(AutomationError::Precondition(
                "target has no debugger URL".to_string(),
            ));
        }
        InspectorSession::connect(&target.web_socket_debugger_url, self.config.command_timeout)
            .await
    }

    /// Kill the proxy process.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// One WebSocket debugger session.
pub struct InspectorSession {
    outgoing: mpsc::Sender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    command_timeout: Duration,
    reader: tokio::task::JoinHandle<()>,
}

impl InspectorSession {
    /// Connect to a debugger URL.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| AutomationError::Socket(format!("connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(64);

        // Writer half: serializes sends onto the socket.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader half: correlates responses to waiters. When the socket
        // closes, dropping the pending senders cancels every waiter.
        let pending_reader = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    let sender = pending_reader
                        .lock()
                        .expect("pending lock")
                        .remove(&id);
                    if let Some(sender) = sender {
                        let _ = sender.send(value);
                    }
                } else {
                    debug!("inspector event: {}", value["method"].as_str().unwrap_or("?"));
                }
            }
            pending_reader.lock().expect("pending lock").clear();
        });

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            command_timeout,
            reader,
        })
    }

    /// Send one command and await its correlated response.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        let frame = json!({ "id": id, "method": method, "params": params });
        if self
            .outgoing
            .send(Message::Text(frame.to_string()))
            .await
            .is_err()
        {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(AutomationError::Cancelled(
                "inspector session closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    return Err(AutomationError::Socket(format!(
                        "inspector command {method} failed: {error}"
                    )));
                }
                Ok(response.get("result").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(_)) => Err(AutomationError::Cancelled(
                "inspector session closed with request pending".to_string(),
            )),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id);
                Err(AutomationError::Timeout(format!(
                    "inspector command {method} timed out"
                )))
            }
        }
    }

    /// Evaluate a script in the page.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(result))
    }

    /// Capture a screenshot, returning raw PNG bytes.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let result = self
            .send_command("Page.captureScreenshot", json!({}))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AutomationError::InvalidOutput("screenshot response missing data".to_string())
            })?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| AutomationError::InvalidOutput(format!("bad screenshot payload: {e}")))
    }

    /// Close the session, cancelling all pending requests.
    pub async fn close(self) {
        let _ = self.outgoing.send(Message::Close(None)).await;
        self.reader.abort();
        self.pending.lock().expect("pending lock").clear();
    }
}
