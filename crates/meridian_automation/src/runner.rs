//! Supervision of the per-device native test-runner subprocess.
//!
//! One runner per device, bound to a unique local port. The supervisor polls
//! the runner's `/status` endpoint until healthy before exposing the
//! context, proxies automation commands as HTTP requests, and watches the
//! child: on exit the context is removed and respawned lazily on next use.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_protocol::{retry_with_backoff, RetryPolicy};
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{AutomationError, Result};

/// Runner configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Path to the runner's xcodeproj.
    pub project_path: String,
    /// Scheme to run.
    pub scheme: String,
    /// First port; contexts use base_port + index.
    pub base_port: u16,
    /// Budget for the runner to become healthy after spawn.
    pub startup_timeout: Duration,
    /// Per-command HTTP timeout.
    pub command_timeout: Duration,
    /// Bundle used when a command names none.
    pub default_bundle_id: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            project_path: "runner/UIRunner.xcodeproj".to_string(),
            scheme: "UIRunner".to_string(),
            base_port: 8100,
            startup_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            default_bundle_id: "com.apple.mobilesafari".to_string(),
        }
    }
}

/// An active automation session bound to one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub bundle_id: String,
}

/// Whether a command for `bundle` requires replacing the current session.
pub fn needs_session_swap(current: Option<&Session>, bundle: &str) -> bool {
    match current {
        Some(session) => session.bundle_id != bundle,
        None => true,
    }
}

/// Per-device runner state.
pub struct DeviceContext {
    pub udid: String,
    pub port: u16,
    child: Child,
    pub session: Option<Session>,
}

impl DeviceContext {
    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Supervisor owning every device context.
pub struct RunnerSupervisor {
    config: RunnerConfig,
    client: reqwest::Client,
    contexts: Mutex<HashMap<String, Arc<Mutex<DeviceContext>>>>,
    next_port_offset: AtomicU16,
}

impl RunnerSupervisor {
    pub fn new(config: RunnerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .build()
            .expect("reqwest client");
        Self {
            config,
            client,
            contexts: Mutex::new(HashMap::new()),
            next_port_offset: AtomicU16::new(0),
        }
    }

    /// Get the context for a device, spawning the runner if needed.
    pub async fn context_for(&self, udid: &str) -> Result<Arc<Mutex<DeviceContext>>> {
        {
            let contexts = self.contexts.lock().await;
            if let Some(ctx) = contexts.get(udid) {
                return Ok(Arc::clone(ctx));
            }
        }

        let ctx = self.spawn_runner(udid).await?;
        let ctx = Arc::new(Mutex::new(ctx));
        self.contexts
            .lock()
            .await
            .insert(udid.to_string(), Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Spawn a runner, retrying with the next port on collision.
    async fn spawn_runner(&self, udid: &str) -> Result<DeviceContext> {
        const PORT_ATTEMPTS: u16 = 5;

        let mut last_err = None;
        for _ in 0..PORT_ATTEMPTS {
            let offset = self.next_port_offset.fetch_add(1, Ordering::Relaxed);
            let port = self.config.base_port + offset;

            match self.spawn_on_port(udid, port).await {
                Ok(ctx) => return Ok(ctx),
                Err(err) => {
                    warn!("runner spawn on port {} failed: {}", port, err);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            AutomationError::Process("runner spawn failed with no attempts".into())
        }))
    }

    async fn spawn_on_port(&self, udid: &str, port: u16) -> Result<DeviceContext> {
        info!("spawning runner for {} on port {}", udid, port);

        let mut child = Command::new("xcodebuild")
            .arg("test-without-building")
            .arg("-project")
            .arg(&self.config.project_path)
            .arg("-scheme")
            .arg(&self.config.scheme)
            .arg("-destination")
            .arg(format!("id={udid}"))
            .env("USE_PORT", port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AutomationError::Process(format!("failed to spawn runner: {e}")))?;

        // The runner must report healthy before the context is exposed.
        let health_url = format!("http://127.0.0.1:{port}/status");
        let policy = RetryPolicy {
            max_attempts: (self.config.startup_timeout.as_secs() as u32).max(4),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            factor: 1.5,
            jitter: true,
        };

        let client = self.client.clone();
        let probe = retry_with_backoff(&policy, "runner health", |_| true, || {
            let client = client.clone();
            let url = health_url.clone();
            async move {
                let response = client.get(&url).send().await?;
                response.error_for_status()?;
                Ok::<_, reqwest::Error>(())
            }
        })
        .await;

        if let Err(err) = probe {
            let _ = child.kill().await;
            return Err(AutomationError::Process(format!(
                "runner on port {port} never became healthy: {err}"
            )));
        }

        Ok(DeviceContext {
            udid: udid.to_string(),
            port,
            child,
            session: None,
        })
    }

    /// Remove a context whose child exited; the next command respawns.
    pub async fn reap(&self, udid: &str) {
        let mut contexts = self.contexts.lock().await;
        if let Some(ctx) = contexts.get(udid) {
            let mut guard = ctx.lock().await;
            if let Ok(Some(status)) = guard.child.try_wait() {
                warn!("runner for {} exited with {}; context removed", udid, status);
                drop(guard);
                contexts.remove(udid);
            }
        }
    }

    /// Ensure a session bound to `bundle_id`, deleting any session bound to
    /// a different bundle first.
    pub async fn ensure_session(&self, udid: &str, bundle_id: Option<&str>) -> Result<Session> {
        self.reap(udid).await;
        let bundle = bundle_id.unwrap_or(&self.config.default_bundle_id).to_string();
        let ctx = self.context_for(udid).await?;
        let mut guard = ctx.lock().await;

        if !needs_session_swap(guard.session.as_ref(), &bundle) {
            return Ok(guard.session.clone().expect("session present"));
        }

        let base = guard.base_url();
        if let Some(old) = guard.session.take() {
            info!("deleting session {} (bundle {})", old.id, old.bundle_id);
            let _ = self
                .client
                .delete(format!("{base}/session/{}", old.id))
                .send()
                .await;
        }

        let response: Value = self
            .client
            .post(format!("{base}/session"))
            .json(&json!({ "capabilities": { "bundleId": bundle } }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let session_id = response
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AutomationError::InvalidOutput("runner session response missing sessionId".into())
            })?
            .to_string();

        let session = Session {
            id: session_id,
            bundle_id: bundle,
        };
        guard.session = Some(session.clone());
        Ok(session)
    }

    async fn session_request(
        &self,
        udid: &str,
        bundle_id: Option<&str>,
        build: impl Fn(&str, &Session) -> reqwest::RequestBuilder,
    ) -> Result<Value> {
        let session = self.ensure_session(udid, bundle_id).await?;
        let ctx = self.context_for(udid).await?;
        let base = ctx.lock().await.base_url();

        let response = build(&base, &session).send().await?.error_for_status()?;
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(body)
    }

    /// Tap at screen coordinates.
    pub async fn tap(&self, udid: &str, bundle_id: Option<&str>, x: f64, y: f64) -> Result<Value> {
        self.session_request(udid, bundle_id, |base, session| {
            self.client
                .post(format!("{base}/session/{}/wda/tap", session.id))
                .json(&json!({ "x": x, "y": y }))
        })
        .await
    }

    /// Swipe between two points.
    pub async fn swipe(
        &self,
        udid: &str,
        bundle_id: Option<&str>,
        from: (f64, f64),
        to: (f64, f64),
        duration_ms: u64,
    ) -> Result<Value> {
        self.session_request(udid, bundle_id, |base, session| {
            self.client
                .post(format!("{base}/session/{}/wda/dragfromtoforduration", session.id))
                .json(&json!({
                    "fromX": from.0,
                    "fromY": from.1,
                    "toX": to.0,
                    "toY": to.1,
                    "duration": duration_ms as f64 / 1000.0
                }))
        })
        .await
    }

    /// Type text into the focused element.
    pub async fn type_text(
        &self,
        udid: &str,
        bundle_id: Option<&str>,
        text: &str,
    ) -> Result<Value> {
        let value: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        self.session_request(udid, bundle_id, |base, session| {
            self.client
                .post(format!("{base}/session/{}/wda/keys", session.id))
                .json(&json!({ "value": value }))
        })
        .await
    }

    /// Press a hardware button (home, volumeUp, volumeDown).
    pub async fn press_button(
        &self,
        udid: &str,
        bundle_id: Option<&str>,
        button: &str,
    ) -> Result<Value> {
        self.session_request(udid, bundle_id, |base, session| {
            self.client
                .post(format!("{base}/session/{}/wda/pressButton", session.id))
                .json(&json!({ "name": button }))
        })
        .await
    }

    /// Current accessibility page source.
    pub async fn page_source(&self, udid: &str, bundle_id: Option<&str>) -> Result<Value> {
        self.session_request(udid, bundle_id, |base, session| {
            self.client.get(format!("{base}/session/{}/source", session.id))
        })
        .await
    }

    /// Launch an application.
    pub async fn launch_app(&self, udid: &str, bundle_id: &str) -> Result<Value> {
        self.session_request(udid, Some(bundle_id), |base, session| {
            self.client
                .post(format!("{base}/session/{}/wda/apps/launch", session.id))
                .json(&json!({ "bundleId": bundle_id }))
        })
        .await
    }

    /// Terminate an application.
    pub async fn terminate_app(&self, udid: &str, bundle_id: &str) -> Result<Value> {
        self.session_request(udid, Some(bundle_id), |base, session| {
            self.client
                .post(format!("{base}/session/{}/wda/apps/terminate", session.id))
                .json(&json!({ "bundleId": bundle_id }))
        })
        .await
    }

    /// Current session (if any) for a device, for status reporting.
    pub async fn current_session(&self, udid: &str) -> Option<Session> {
        let contexts = self.contexts.lock().await;
        let ctx = contexts.get(udid)?.clone();
        drop(contexts);
        let session = ctx.lock().await.session.clone();
        session
    }

    /// Terminate every supervised runner.
    pub async fn shutdown(&self) {
        let mut contexts = self.contexts.lock().await;
        for (udid, ctx) in contexts.drain() {
            let mut guard = ctx.lock().await;
            if let Err(err) = guard.child.kill().await {
                warn!("failed to kill runner for {}: {}", udid, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(bundle: &str) -> Session {
        Session {
            id: "s1".into(),
            bundle_id: bundle.into(),
        }
    }

    #[test]
    fn test_session_swap_logic() {
        // No session yet: always create.
        assert!(needs_session_swap(None, "com.example.a"));
        // Same bundle: reuse.
        assert!(!needs_session_swap(Some(&session("com.example.a")), "com.example.a"));
        // Different bundle: delete old, create new.
        assert!(needs_session_swap(Some(&session("com.example.a")), "com.example.b"));
    }

    #[test]
    fn test_port_allocation_advances() {
        let supervisor = RunnerSupervisor::new(RunnerConfig::default());
        let a = supervisor.next_port_offset.fetch_add(1, Ordering::Relaxed);
        let b = supervisor.next_port_offset.fetch_add(1, Ordering::Relaxed);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.base_port, 8100);
        assert!(!config.default_bundle_id.is_empty());
    }
}
