//! iOS automation tools: simulator lifecycle, runner-proxied UI commands,
//! and inspector sessions.

use async_trait::async_trait;
use base64::Engine;
use meridian_automation::simctl;
use meridian_policy::CommandRequest;
use meridian_protocol::ToolResult;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::Tool;
use crate::context::{Authorization, ServerContext};

pub struct IosDevicesTool;

#[async_trait]
impl Tool for IosDevicesTool {
    fn name(&self) -> &'static str {
        "ios_devices"
    }

    fn description(&self) -> &'static str {
        "List available simulators"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _ctx: &ServerContext) -> ToolResult<Value> {
        let devices = simctl::list_devices().await?;
        Ok(json!({ "devices": devices }))
    }
}

pub struct IosBootTool;

#[derive(Debug, Deserialize)]
struct BootArgs {
    udid: String,
    #[serde(default = "default_boot_timeout")]
    timeout_secs: u64,
}

fn default_boot_timeout() -> u64 {
    60
}

#[async_trait]
impl Tool for IosBootTool {
    fn name(&self) -> &'static str {
        "ios_boot"
    }

    fn description(&self) -> &'static str {
        "Boot a simulator if it is shut down and wait for Booted"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "timeout_secs": { "type": "integer", "default": 60 }
            },
            "required": ["udid"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: BootArgs = serde_json::from_value(args)?;
        let device =
            simctl::ensure_booted(&parsed.udid, Duration::from_secs(parsed.timeout_secs)).await?;
        Ok(serde_json::to_value(device).unwrap_or(Value::Null))
    }
}

#[derive(Debug, Deserialize)]
struct TapArgs {
    udid: String,
    x: f64,
    y: f64,
    #[serde(default)]
    bundle_id: Option<String>,
}

pub struct IosTapTool;

#[async_trait]
impl Tool for IosTapTool {
    fn name(&self) -> &'static str {
        "ios_tap"
    }

    fn description(&self) -> &'static str {
        "Tap at screen coordinates in the bound application's session"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "x": { "type": "number" },
                "y": { "type": "number" },
                "bundle_id": { "type": "string" }
            },
            "required": ["udid", "x", "y"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: TapArgs = serde_json::from_value(args)?;
        let result = ctx
            .runner
            .tap(&parsed.udid, parsed.bundle_id.as_deref(), parsed.x, parsed.y)
            .await?;
        Ok(json!({ "ok": true, "response": result }))
    }
}

#[derive(Debug, Deserialize)]
struct SwipeArgs {
    udid: String,
    from_x: f64,
    from_y: f64,
    to_x: f64,
    to_y: f64,
    #[serde(default = "default_swipe_ms")]
    duration_ms: u64,
    #[serde(default)]
    bundle_id: Option<String>,
}

fn default_swipe_ms() -> u64 {
    300
}

pub struct IosSwipeTool;

#[async_trait]
impl Tool for IosSwipeTool {
    fn name(&self) -> &'static str {
        "ios_swipe"
    }

    fn description(&self) -> &'static str {
        "Swipe between two points"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "from_x": { "type": "number" },
                "from_y": { "type": "number" },
                "to_x": { "type": "number" },
                "to_y": { "type": "number" },
                "duration_ms": { "type": "integer", "default": 300 },
                "bundle_id": { "type": "string" }
            },
            "required": ["udid", "from_x", "from_y", "to_x", "to_y"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: SwipeArgs = serde_json::from_value(args)?;
        let result = ctx
            .runner
            .swipe(
                &parsed.udid,
                parsed.bundle_id.as_deref(),
                (parsed.from_x, parsed.from_y),
                (parsed.to_x, parsed.to_y),
                parsed.duration_ms,
            )
            .await?;
        Ok(json!({ "ok": true, "response": result }))
    }
}

#[derive(Debug, Deserialize)]
struct TypeTextArgs {
    udid: String,
    text: String,
    #[serde(default)]
    bundle_id: Option<String>,
}

pub struct IosTypeTextTool;

#[async_trait]
impl Tool for IosTypeTextTool {
    fn name(&self) -> &'static str {
        "ios_type_text"
    }

    fn description(&self) -> &'static str {
        "Type text into the focused element"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "text": { "type": "string" },
                "bundle_id": { "type": "string" }
            },
            "required": ["udid", "text"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: TypeTextArgs = serde_json::from_value(args)?;
        let result = ctx
            .runner
            .type_text(&parsed.udid, parsed.bundle_id.as_deref(), &parsed.text)
            .await?;
        Ok(json!({ "ok": true, "response": result }))
    }
}

#[derive(Debug, Deserialize)]
struct PressButtonArgs {
    udid: String,
    button: String,
    #[serde(default)]
    bundle_id: Option<String>,
}

pub struct IosPressButtonTool;

#[async_trait]
impl Tool for IosPressButtonTool {
    fn name(&self) -> &'static str {
        "ios_press_button"
    }

    fn description(&self) -> &'static str {
        "Press a hardware button (home, volumeUp, volumeDown)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "button": { "type": "string", "enum": ["home", "volumeUp", "volumeDown"] },
                "bundle_id": { "type": "string" }
            },
            "required": ["udid", "button"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: PressButtonArgs = serde_json::from_value(args)?;
        let result = ctx
            .runner
            .press_button(&parsed.udid, parsed.bundle_id.as_deref(), &parsed.button)
            .await?;
        Ok(json!({ "ok": true, "response": result }))
    }
}

#[derive(Debug, Deserialize)]
struct PageSourceArgs {
    udid: String,
    #[serde(default)]
    bundle_id: Option<String>,
}

pub struct IosPageSourceTool;

#[async_trait]
impl Tool for IosPageSourceTool {
    fn name(&self) -> &'static str {
        "ios_page_source"
    }

    fn description(&self) -> &'static str {
        "Accessibility page source of the bound application"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "bundle_id": { "type": "string" }
            },
            "required": ["udid"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: PageSourceArgs = serde_json::from_value(args)?;
        let source = ctx
            .runner
            .page_source(&parsed.udid, parsed.bundle_id.as_deref())
            .await?;
        let session = ctx.runner.current_session(&parsed.udid).await;
        Ok(json!({
            "source": source,
            "bundle_id": session.map(|s| s.bundle_id),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct AppArgs {
    udid: String,
    bundle_id: String,
    #[serde(default)]
    confirmation_token: Option<String>,
    #[serde(default)]
    pin: Option<String>,
}

pub struct IosAppLaunchTool;

#[async_trait]
impl Tool for IosAppLaunchTool {
    fn name(&self) -> &'static str {
        "ios_app_launch"
    }

    fn description(&self) -> &'static str {
        "Launch an application on a simulator"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "bundle_id": { "type": "string" }
            },
            "required": ["udid", "bundle_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: AppArgs = serde_json::from_value(args)?;
        let result = ctx.runner.launch_app(&parsed.udid, &parsed.bundle_id).await?;
        Ok(json!({ "ok": true, "response": result }))
    }
}

pub struct IosAppTerminateTool;

#[async_trait]
impl Tool for IosAppTerminateTool {
    fn name(&self) -> &'static str {
        "ios_app_terminate"
    }

    fn description(&self) -> &'static str {
        "Terminate an application (policy-gated)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "udid": { "type": "string" },
                "bundle_id": { "type": "string" },
                "confirmation_token": { "type": "string" },
                "pin": { "type": "string" }
            },
            "required": ["udid", "bundle_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let parsed: AppArgs = serde_json::from_value(args)?;

        let mut fields = Map::new();
        fields.insert("bundle_id".into(), Value::String(parsed.bundle_id.clone()));
        let cmd = CommandRequest {
            tool: "ios_app_terminate".into(),
            action: "terminate".into(),
            target: parsed.bundle_id.clone(),
            tags: vec!["automation".into()],
            area: None,
            tenant: None,
            value: None,
            fields,
        };

        let auth = ctx.authorize(
            "ios_app_terminate",
            cmd,
            parsed.confirmation_token.as_deref(),
            parsed.pin.as_deref(),
            &snapshot,
        )?;
        let (risk, confirmed_by) = match auth {
            Authorization::Pending(payload) => return Ok(payload),
            Authorization::Allowed {
                risk, confirmed_by, ..
            } => (risk, confirmed_by),
        };

        let result = ctx
            .runner
            .terminate_app(&parsed.udid, &parsed.bundle_id)
            .await;
        ctx.audit_exec(
            "ios_app_terminate",
            &parsed.bundle_id,
            snapshot,
            risk,
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()),
            confirmed_by,
        );

        let response = result?;
        Ok(json!({ "ok": true, "response": response }))
    }
}

pub struct IosInspectorTargetsTool;

#[async_trait]
impl Tool for IosInspectorTargetsTool {
    fn name(&self) -> &'static str {
        "ios_inspector_targets"
    }

    fn description(&self) -> &'static str {
        "List inspectable web pages via the inspector proxy"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let targets = ctx.inspector.list_targets().await?;
        Ok(json!({ "targets": targets }))
    }
}

#[derive(Debug, Deserialize)]
struct EvaluateArgs {
    target_url: String,
    expression: String,
}

pub struct IosInspectorEvaluateTool;

#[async_trait]
impl Tool for IosInspectorEvaluateTool {
    fn name(&self) -> &'static str {
        "ios_inspector_evaluate"
    }

    fn description(&self) -> &'static str {
        "Evaluate a script in an inspectable page"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string", "description": "webSocketDebuggerUrl of the target" },
                "expression": { "type": "string" }
            },
            "required": ["target_url", "expression"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: EvaluateArgs = serde_json::from_value(args)?;
        let session = meridian_automation::InspectorSession::connect(
            &parsed.target_url,
            ctx.config.inspector.command_timeout,
        )
        .await?;
        let result = session.evaluate(&parsed.expression).await;
        session.close().await;
        Ok(json!({ "value": result? }))
    }
}

#[derive(Debug, Deserialize)]
struct ScreenshotArgs {
    target_url: String,
}

pub struct IosInspectorScreenshotTool;

#[async_trait]
impl Tool for IosInspectorScreenshotTool {
    fn name(&self) -> &'static str {
        "ios_inspector_screenshot"
    }

    fn description(&self) -> &'static str {
        "Capture a screenshot of an inspectable page"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target_url": { "type": "string" }
            },
            "required": ["target_url"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: ScreenshotArgs = serde_json::from_value(args)?;
        let session = meridian_automation::InspectorSession::connect(
            &parsed.target_url,
            ctx.config.inspector.command_timeout,
        )
        .await?;
        let result = session.screenshot().await;
        session.close().await;
        let bytes = result?;
        Ok(json!({
            "format": "png",
            "size": bytes.len(),
            "data_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
        }))
    }
}
