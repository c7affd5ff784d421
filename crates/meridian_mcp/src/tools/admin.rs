//! Connection administration, health, and cache controls.

use async_trait::async_trait;
use meridian_protocol::{ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Value};

use super::Tool;
use crate::context::ServerContext;

pub struct DbConnectTool;

#[derive(Debug, Deserialize)]
struct ConnectArgs {
    url: String,
    #[serde(default)]
    id: Option<String>,
}

#[async_trait]
impl Tool for DbConnectTool {
    fn name(&self) -> &'static str {
        "db_connect"
    }

    fn description(&self) -> &'static str {
        "Open a connection pool; the first one becomes active"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "postgres:// connection string" },
                "id": { "type": "string" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: ConnectArgs = serde_json::from_value(args)?;
        let id = ctx
            .connections
            .add_connection(&parsed.url, parsed.id)
            .await?;
        Ok(json!({
            "id": id,
            "active": ctx.connections.active_id().as_deref() == Some(id.as_str()),
        }))
    }
}

pub struct DbSwitchTool;

#[async_trait]
impl Tool for DbSwitchTool {
    fn name(&self) -> &'static str {
        "db_switch"
    }

    fn description(&self) -> &'static str {
        "Atomically make a registered connection the active one"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let id = args["id"].as_str().unwrap_or_default();
        ctx.connections.switch_connection(id)?;
        Ok(json!({ "active": id }))
    }
}

pub struct DbConnectionsTool;

#[async_trait]
impl Tool for DbConnectionsTool {
    fn name(&self) -> &'static str {
        "db_connections"
    }

    fn description(&self) -> &'static str {
        "List registered connections with pool and breaker state"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "connections": ctx.connections.list() }))
    }
}

pub struct DbHealthTool;

#[async_trait]
impl Tool for DbHealthTool {
    fn name(&self) -> &'static str {
        "db_health"
    }

    fn description(&self) -> &'static str {
        "Pool statistics, breaker states, cache stats and uptime"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(health_report(ctx).await)
    }
}

/// Shared by the tool and the db://health resource.
pub async fn health_report(ctx: &ServerContext) -> Value {
    json!({
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "active_connection": ctx.connections.active_id(),
        "connections": ctx.connections.list(),
        "cache": ctx.cache.stats(),
        "subscribers": ctx.hub.subscriber_count(),
        "open_transactions": ctx.transactions.open_count().await,
        "pending_confirmations": ctx.confirmations.pending_count(),
        "metrics": ctx.metrics.snapshot(),
    })
}

pub struct DbCacheStatsTool;

#[async_trait]
impl Tool for DbCacheStatsTool {
    fn name(&self) -> &'static str {
        "db_cache_stats"
    }

    fn description(&self) -> &'static str {
        "Cache hit/miss/eviction counters"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(serde_json::to_value(ctx.cache.stats()).unwrap_or(Value::Null))
    }
}

pub struct DbCacheClearTool;

#[derive(Debug, Deserialize)]
struct CacheClearArgs {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
}

#[async_trait]
impl Tool for DbCacheClearTool {
    fn name(&self) -> &'static str {
        "db_cache_clear"
    }

    fn description(&self) -> &'static str {
        "Clear the cache, one namespace, or entries matching a pattern"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "namespace": { "type": "string" },
                "pattern": { "type": "string", "description": "Regex over cache keys" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: CacheClearArgs = serde_json::from_value(args)?;
        match parsed.pattern {
            Some(pattern) => {
                let removed = ctx
                    .cache
                    .invalidate_pattern(&pattern, parsed.namespace.as_deref())
                    .await
                    .map_err(|e| ToolError::invalid_argument(format!("bad pattern: {e}")))?;
                Ok(json!({ "invalidated": removed }))
            }
            None => {
                ctx.cache.clear(parsed.namespace.as_deref()).await;
                Ok(json!({ "cleared": true }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn test_connect_requires_url() {
        let tool = DbConnectTool;
        assert!(schema::validate(&tool.input_schema(), &json!({})).is_err());
        assert!(schema::validate(
            &tool.input_schema(),
            &json!({ "url": "postgres://u:p@h/db" })
        )
        .is_ok());
    }
}
