//! Server introspection.

use async_trait::async_trait;
use meridian_protocol::ToolResult;
use serde_json::{json, Value};

use super::Tool;
use crate::context::ServerContext;

pub struct ServerStatsTool;

#[async_trait]
impl Tool for ServerStatsTool {
    fn name(&self) -> &'static str {
        "server_stats"
    }

    fn description(&self) -> &'static str {
        "Server counters, uptime and subsystem sizes"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({
            "uptime_secs": ctx.started_at.elapsed().as_secs(),
            "metrics": ctx.metrics.snapshot(),
            "cache": ctx.cache.stats(),
            "subscribers": ctx.hub.subscriber_count(),
            "audit_entries": ctx.audit.len(),
            "connections": ctx.connections.pool_count(),
        }))
    }
}
