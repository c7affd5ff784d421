//! Subscription tools: subscribe, poll/acknowledge, unsubscribe.

use async_trait::async_trait;
use meridian_protocol::{ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Value};

use super::Tool;
use crate::context::ServerContext;
use crate::hub::OverflowPolicy;
use crate::metrics::Metrics;

pub struct DbSubscribeTool;

#[derive(Debug, Deserialize)]
struct SubscribeArgs {
    channels: Vec<String>,
    #[serde(default)]
    buffer_size: Option<usize>,
    #[serde(default)]
    overflow: Option<OverflowPolicy>,
    #[serde(default)]
    tenant: Option<String>,
}

#[async_trait]
impl Tool for DbSubscribeTool {
    fn name(&self) -> &'static str {
        "db_subscribe"
    }

    fn description(&self) -> &'static str {
        "Subscribe to database change notifications on the given channels"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "channels": { "type": "array", "items": { "type": "string" } },
                "buffer_size": { "type": "integer" },
                "overflow": { "type": "string", "enum": ["DROP_OLDEST", "DROP_NEWEST", "DISCONNECT"] },
                "tenant": { "type": "string" }
            },
            "required": ["channels"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: SubscribeArgs = serde_json::from_value(args)?;
        if parsed.channels.is_empty() {
            return Err(ToolError::invalid_argument("channels must not be empty"));
        }

        // One LISTEN connection per server feeds every subscriber.
        let pool = ctx.pool_for(parsed.tenant.as_deref())?;
        crate::hub::SubscriptionHub::ensure_listener(
            &ctx.hub,
            pool.pool().clone(),
            &parsed.channels,
        )
        .await?;

        let id = ctx.hub.subscribe(
            parsed.channels.clone(),
            parsed.buffer_size,
            parsed.overflow.unwrap_or_default(),
        );

        Ok(json!({
            "subscription_id": id,
            "channels": parsed.channels,
            "buffer_size": parsed.buffer_size.unwrap_or(ctx.config.subscription_buffer),
        }))
    }
}

pub struct DbSubscriptionPollTool;

#[derive(Debug, Deserialize)]
struct PollArgs {
    subscription_id: String,
    #[serde(default = "default_max_events")]
    max_events: usize,
    #[serde(default)]
    ack: Option<u64>,
}

fn default_max_events() -> usize {
    100
}

#[async_trait]
impl Tool for DbSubscriptionPollTool {
    fn name(&self) -> &'static str {
        "db_subscription_poll"
    }

    fn description(&self) -> &'static str {
        "Drain buffered events in sequence order, acknowledging delivery"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "subscription_id": { "type": "string" },
                "max_events": { "type": "integer", "default": 100 },
                "ack": { "type": "integer", "description": "Highest sequence already processed" }
            },
            "required": ["subscription_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: PollArgs = serde_json::from_value(args)?;
        let output = ctx
            .hub
            .poll(&parsed.subscription_id, parsed.max_events.max(1), parsed.ack)?;

        if output.disconnected {
            Metrics::inc(&ctx.metrics.subscribers_disconnected);
        }

        Ok(serde_json::to_value(output).unwrap_or(Value::Null))
    }
}

pub struct DbUnsubscribeTool;

#[async_trait]
impl Tool for DbUnsubscribeTool {
    fn name(&self) -> &'static str {
        "db_unsubscribe"
    }

    fn description(&self) -> &'static str {
        "Close a subscription; calling twice is a no-op"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "subscription_id": { "type": "string" } },
            "required": ["subscription_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let id = args["subscription_id"].as_str().unwrap_or_default();
        let removed = ctx.hub.unsubscribe(id);
        Ok(json!({ "unsubscribed": true, "was_subscribed": removed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_policy_parses() {
        let args: SubscribeArgs = serde_json::from_value(json!({
            "channels": ["orders"],
            "overflow": "DISCONNECT"
        }))
        .unwrap();
        assert_eq!(args.overflow, Some(OverflowPolicy::Disconnect));
    }

    #[test]
    fn test_poll_defaults() {
        let args: PollArgs =
            serde_json::from_value(json!({ "subscription_id": "s1" })).unwrap();
        assert_eq!(args.max_events, 100);
        assert!(args.ack.is_none());
    }
}
