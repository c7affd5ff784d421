//! Home automation tools. Every mutating call is policy-gated; state
//! changes fan out to the subscription hub and the audit log.

use async_trait::async_trait;
use meridian_policy::CommandRequest;
use meridian_protocol::ToolResult;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::Tool;
use crate::context::{Authorization, ServerContext};
use crate::metrics::Metrics;

/// Channel used for device change events on the hub.
pub const HOME_EVENTS_CHANNEL: &str = "home_events";

fn command_for(
    tool: &str,
    action: &str,
    ctx: &ServerContext,
    device_id: &str,
    value: Option<f64>,
) -> ToolResult<CommandRequest> {
    let device = ctx.home.device(device_id)?;
    let mut fields = Map::new();
    fields.insert("device_id".into(), Value::String(device_id.to_string()));
    fields.insert("action".into(), Value::String(action.to_string()));
    if let Some(v) = value {
        fields.insert("value".into(), json!(v));
    }
    Ok(CommandRequest {
        tool: tool.to_string(),
        action: action.to_string(),
        target: device_id.to_string(),
        tags: device.tags.clone(),
        area: Some(device.area.clone()),
        tenant: None,
        value,
        fields,
    })
}

/// Authorize and run one device command, publishing the change event.
async fn run_gated_command(
    ctx: &ServerContext,
    tool: &'static str,
    action: &str,
    device_id: &str,
    value: Option<f64>,
    confirmation_token: Option<&str>,
    pin: Option<&str>,
    snapshot: &Value,
) -> ToolResult<Value> {
    let cmd = command_for(tool, action, ctx, device_id, value)?;
    let auth = ctx.authorize(tool, cmd, confirmation_token, pin, snapshot)?;

    let (risk, confirmed_by, modified_value) = match auth {
        Authorization::Pending(payload) => return Ok(payload),
        Authorization::Allowed {
            risk,
            confirmed_by,
            modified_value,
            ..
        } => (risk, confirmed_by, modified_value),
    };

    let effective = modified_value.or(value);
    let result = ctx.home.apply(device_id, action, effective);
    ctx.audit_exec(
        tool,
        device_id,
        snapshot.clone(),
        risk,
        result.is_ok(),
        result.as_ref().err().map(|e| e.to_string()),
        confirmed_by,
    );

    let change = result?;
    let stats = ctx.hub.dispatch(
        HOME_EVENTS_CHANNEL,
        json!({
            "device_id": change.device_id,
            "action": change.action,
            "state": change.state,
        }),
    );
    for _ in 0..stats.delivered {
        Metrics::inc(&ctx.metrics.events_dispatched);
    }

    Ok(json!({
        "decision": "ALLOW",
        "device_id": change.device_id,
        "action": change.action,
        "state": change.state,
        "modified_value": modified_value,
    }))
}

pub struct HomeDevicesTool;

#[async_trait]
impl Tool for HomeDevicesTool {
    fn name(&self) -> &'static str {
        "home_devices"
    }

    fn description(&self) -> &'static str {
        "List devices with their current state"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "devices": ctx.home.devices() }))
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCommandArgs {
    device_id: String,
    action: String,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    confirmation_token: Option<String>,
    #[serde(default)]
    pin: Option<String>,
}

pub struct HomeDeviceCommandTool;

#[async_trait]
impl Tool for HomeDeviceCommandTool {
    fn name(&self) -> &'static str {
        "home_device_command"
    }

    fn description(&self) -> &'static str {
        "Send a command (turn_on, turn_off, toggle, set_temperature) to a device"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "device_id": { "type": "string" },
                "action": { "type": "string", "enum": ["turn_on", "turn_off", "toggle", "set_temperature", "lock", "unlock"] },
                "value": { "type": "number" },
                "confirmation_token": { "type": "string" },
                "pin": { "type": "string" }
            },
            "required": ["device_id", "action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let parsed: DeviceCommandArgs = serde_json::from_value(args)?;
        run_gated_command(
            ctx,
            "home_device_command",
            &parsed.action,
            &parsed.device_id,
            parsed.value,
            parsed.confirmation_token.as_deref(),
            parsed.pin.as_deref(),
            &snapshot,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct LockArgs {
    device_id: String,
    #[serde(default)]
    confirmation_token: Option<String>,
    #[serde(default)]
    pin: Option<String>,
}

fn lock_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "device_id": { "type": "string" },
            "confirmation_token": { "type": "string" },
            "pin": { "type": "string" }
        },
        "required": ["device_id"]
    })
}

pub struct HomeLockTool;

#[async_trait]
impl Tool for HomeLockTool {
    fn name(&self) -> &'static str {
        "home_lock"
    }

    fn description(&self) -> &'static str {
        "Lock a door lock"
    }

    fn input_schema(&self) -> Value {
        lock_schema()
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let parsed: LockArgs = serde_json::from_value(args)?;
        run_gated_command(
            ctx,
            "home_lock",
            "lock",
            &parsed.device_id,
            None,
            parsed.confirmation_token.as_deref(),
            parsed.pin.as_deref(),
            &snapshot,
        )
        .await
    }
}

pub struct HomeUnlockTool;

#[async_trait]
impl Tool for HomeUnlockTool {
    fn name(&self) -> &'static str {
        "home_unlock"
    }

    fn description(&self) -> &'static str {
        "Unlock a door lock (high risk; requires confirmation unless a policy allows)"
    }

    fn input_schema(&self) -> Value {
        lock_schema()
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let parsed: LockArgs = serde_json::from_value(args)?;
        run_gated_command(
            ctx,
            "home_unlock",
            "unlock",
            &parsed.device_id,
            None,
            parsed.confirmation_token.as_deref(),
            parsed.pin.as_deref(),
            &snapshot,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct ThermostatArgs {
    device_id: String,
    temperature: f64,
    #[serde(default)]
    confirmation_token: Option<String>,
    #[serde(default)]
    pin: Option<String>,
}

pub struct HomeThermostatTool;

#[async_trait]
impl Tool for HomeThermostatTool {
    fn name(&self) -> &'static str {
        "home_thermostat_set"
    }

    fn description(&self) -> &'static str {
        "Set a thermostat target temperature"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "device_id": { "type": "string" },
                "temperature": { "type": "number" },
                "confirmation_token": { "type": "string" },
                "pin": { "type": "string" }
            },
            "required": ["device_id", "temperature"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let parsed: ThermostatArgs = serde_json::from_value(args)?;
        run_gated_command(
            ctx,
            "home_thermostat_set",
            "set_temperature",
            &parsed.device_id,
            Some(parsed.temperature),
            parsed.confirmation_token.as_deref(),
            parsed.pin.as_deref(),
            &snapshot,
        )
        .await
    }
}

pub struct HomeSceneTool;

#[async_trait]
impl Tool for HomeSceneTool {
    fn name(&self) -> &'static str {
        "home_scene_activate"
    }

    fn description(&self) -> &'static str {
        "Activate a scene, applying each of its device commands"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "scene_id": { "type": "string" },
                "confirmation_token": { "type": "string" },
                "pin": { "type": "string" }
            },
            "required": ["scene_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let scene_id = args["scene_id"].as_str().unwrap_or_default().to_string();
        let token = args
            .get("confirmation_token")
            .and_then(Value::as_str)
            .map(String::from);
        let pin = args.get("pin").and_then(Value::as_str).map(String::from);

        let scene = ctx.home.scene(&scene_id)?;
        let mut fields = Map::new();
        fields.insert("scene_id".into(), Value::String(scene_id.clone()));
        let cmd = CommandRequest {
            tool: "home_scene_activate".into(),
            action: "activate".into(),
            target: scene_id.clone(),
            tags: vec!["scene".into()],
            area: None,
            tenant: None,
            value: None,
            fields,
        };

        let auth = ctx.authorize(
            "home_scene_activate",
            cmd,
            token.as_deref(),
            pin.as_deref(),
            &snapshot,
        )?;
        let (risk, confirmed_by) = match auth {
            Authorization::Pending(payload) => return Ok(payload),
            Authorization::Allowed {
                risk, confirmed_by, ..
            } => (risk, confirmed_by),
        };

        let result = ctx.home.activate_scene(&scene.id);
        ctx.audit_exec(
            "home_scene_activate",
            &scene.id,
            snapshot,
            risk,
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()),
            confirmed_by,
        );

        let changes = result?;
        for change in &changes {
            ctx.hub.dispatch(
                HOME_EVENTS_CHANNEL,
                json!({
                    "device_id": change.device_id,
                    "action": change.action,
                    "state": change.state,
                }),
            );
        }

        Ok(json!({
            "decision": "ALLOW",
            "scene_id": scene.id,
            "applied": changes.len(),
        }))
    }
}

pub struct HomeAuditTool;

#[async_trait]
impl Tool for HomeAuditTool {
    fn name(&self) -> &'static str {
        "home_audit"
    }

    fn description(&self) -> &'static str {
        "Recent audit entries for policy-gated commands"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "limit": { "type": "integer", "default": 50 } }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(50)
            .min(1000) as usize;
        let entries = ctx.audit.recent(limit);
        Ok(json!({ "entries": entries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn test_unlock_schema_requires_device() {
        let tool = HomeUnlockTool;
        assert!(schema::validate(&tool.input_schema(), &json!({})).is_err());
        assert!(
            schema::validate(&tool.input_schema(), &json!({ "device_id": "door_front" })).is_ok()
        );
    }

    #[test]
    fn test_device_command_action_enum() {
        let tool = HomeDeviceCommandTool;
        let err = schema::validate(
            &tool.input_schema(),
            &json!({ "device_id": "x", "action": "explode" }),
        )
        .unwrap_err();
        assert!(err.contains("action"));
    }
}
