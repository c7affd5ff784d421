//! Simulator discovery and boot via the platform `simctl` utility.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::info;

use crate::error::{AutomationError, Result};

/// Simulator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Shutdown,
    Booting,
    Booted,
    Unknown,
}

impl DeviceState {
    fn parse(raw: &str) -> Self {
        match raw {
            "Shutdown" => Self::Shutdown,
            "Booting" => Self::Booting,
            "Booted" => Self::Booted,
            _ => Self::Unknown,
        }
    }
}

/// Normalized device record.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub udid: String,
    pub name: String,
    pub runtime: String,
    pub state: DeviceState,
    pub platform: String,
}

async fn simctl(args: &[&str]) -> Result<String> {
    let output = Command::new("xcrun")
        .arg("simctl")
        .args(args)
        .output()
        .await
        .map_err(|e| AutomationError::Process(format!("failed to run simctl: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AutomationError::Process(format!(
            "simctl {} exited with {}: {}",
            args.first().unwrap_or(&""),
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse the `simctl list devices --json` document into normalized records.
pub fn parse_device_list(raw: &Value) -> Result<Vec<DeviceInfo>> {
    let devices = raw
        .get("devices")
        .and_then(Value::as_object)
        .ok_or_else(|| AutomationError::InvalidOutput("missing devices map".into()))?;

    let mut result = Vec::new();
    for (runtime_id, entries) in devices {
        let Some(entries) = entries.as_array() else {
            continue;
        };
        // "com.apple.CoreSimulator.SimRuntime.iOS-17-5" -> "iOS 17.5"
        let raw_name = runtime_id.rsplit('.').next().unwrap_or(runtime_id);
        let runtime = match raw_name.split_once('-') {
            Some((platform, version)) => format!("{platform} {}", version.replace('-', ".")),
            None => raw_name.to_string(),
        };
        let platform = if runtime.starts_with("iOS") {
            "ios"
        } else if runtime.starts_with("tvOS") {
            "tvos"
        } else if runtime.starts_with("watchOS") {
            "watchos"
        } else {
            "unknown"
        };

        for entry in entries {
            let available = entry
                .get("isAvailable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !available {
                continue;
            }
            let udid = entry.get("udid").and_then(Value::as_str).unwrap_or_default();
            let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
            let state = entry.get("state").and_then(Value::as_str).unwrap_or("");
            if udid.is_empty() {
                continue;
            }
            result.push(DeviceInfo {
                udid: udid.to_string(),
                name: name.to_string(),
                runtime: runtime.clone(),
                state: DeviceState::parse(state),
                platform: platform.to_string(),
            });
        }
    }

    Ok(result)
}

/// List available simulators.
pub async fn list_devices() -> Result<Vec<DeviceInfo>> {
    let stdout = simctl(&["list", "devices", "--json"]).await?;
    let raw: Value = serde_json::from_str(&stdout)
        .map_err(|e| AutomationError::InvalidOutput(format!("simctl produced bad JSON: {e}")))?;
    parse_device_list(&raw)
}

/// Find one device by udid.
pub async fn get_device(udid: &str) -> Result<DeviceInfo> {
    list_devices()
        .await?
        .into_iter()
        .find(|d| d.udid == udid)
        .ok_or_else(|| AutomationError::NotFound(format!("no such device: {udid}")))
}

/// Boot a device if it is shut down, then wait for the Booted state.
pub async fn ensure_booted(udid: &str, timeout: Duration) -> Result<DeviceInfo> {
    let device = get_device(udid).await?;
    match device.state {
        DeviceState::Booted => return Ok(device),
        DeviceState::Shutdown => {
            info!("booting simulator {}", udid);
            simctl(&["boot", udid]).await?;
        }
        DeviceState::Booting => {}
        DeviceState::Unknown => {
            return Err(AutomationError::Precondition(format!(
                "device {udid} is in an unknown state"
            )));
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let device = get_device(udid).await?;
        if device.state == DeviceState::Booted {
            return Ok(device);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AutomationError::Precondition(format!(
                "device {udid} did not reach Booted within {}s",
                timeout.as_secs()
            )));
        }
    }
}
