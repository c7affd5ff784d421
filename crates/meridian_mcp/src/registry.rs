//! Tool trait and registry.
//!
//! Tools register once at startup in a fixed order; a duplicate name is a
//! startup error. Dispatch validates arguments against the declared schema
//! and applies per-tenant rate limiting before the executor runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_protocol::{ToolDefinition, ToolError, ToolResult};
use meridian_tenancy::RateLimiter;
use serde_json::Value;
use tracing::debug;

use crate::context::ServerContext;
use crate::metrics::Metrics;
use crate::schema;

/// One server tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (e.g. "db_query").
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// JSON Schema for the structured result.
    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool. Arguments have already passed the schema gate.
    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            output_schema: Some(self.output_schema()),
        }
    }
}

/// Registry of tools, closed before the dispatcher starts serving.
pub struct ToolRegistry {
    order: Vec<Arc<dyn Tool>>,
    by_name: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a tool. A duplicate name fails startup.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.name();
        if self.by_name.contains_key(name) {
            anyhow::bail!("duplicate tool registration: {name}");
        }
        debug!("registering tool: {}", name);
        self.by_name.insert(name, Arc::clone(&tool));
        self.order.push(tool);
        Ok(())
    }

    /// Definitions in registration order.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.order.iter().map(|t| t.definition()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Dispatch one call: lookup, rate limit, schema gate, execute.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        ctx: &ServerContext,
    ) -> ToolResult<Value> {
        let tool = self
            .by_name
            .get(name)
            .ok_or_else(|| ToolError::not_found(format!("unknown tool: {name}")))?;

        Metrics::inc(&ctx.metrics.tool_calls);

        // Per-tenant token bucket gates tool entry.
        let tenant_id = args.get("tenant").and_then(Value::as_str).map(String::from);
        let tenant = ctx.tenants.resolve(tenant_id.as_deref());
        let key = RateLimiter::tools_key(&tenant.id, name);
        if let Err(err) = ctx.limiter.acquire(&key, tenant.tier.limits()).await {
            Metrics::inc(&ctx.metrics.rate_limited);
            return Err(err);
        }

        // Schema gate: the executor is never invoked with invalid arguments.
        if let Err(violation) = schema::validate(&tool.input_schema(), &args) {
            Metrics::inc(&ctx.metrics.schema_rejections);
            return Err(ToolError::invalid_argument(violation));
        }

        let result = tool.execute(args, ctx).await;
        if result.is_err() {
            Metrics::inc(&ctx.metrics.tool_errors);
        }
        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo arguments back"
        }

        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            })
        }

        async fn execute(&self, args: Value, _ctx: &ServerContext) -> ToolResult<Value> {
            Ok(json!({ "echo": args["message"] }))
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert!(registry.register(Arc::new(EchoTool)).is_err());
    }

    #[test]
    fn test_listing_preserves_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let tools = registry.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert!(tools[0].output_schema.is_some());
    }
}
