//! Integration plugin tools. Registered only when at least one integration
//! token is configured; each call resolves the named adapter and checks the
//! tenant's plugin allowance and the per-upstream bulkhead.

use async_trait::async_trait;
use meridian_protocol::{ToolError, ToolResult};
use meridian_tenancy::{InvoiceRequest, LabelRequest, OrderQuery, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value};

use super::Tool;
use crate::context::ServerContext;

async fn gated_plugin(
    ctx: &ServerContext,
    name: &str,
    tenant_id: Option<&str>,
) -> ToolResult<std::sync::Arc<dyn meridian_tenancy::IntegrationPlugin>> {
    let tenant = ctx.tenants.resolve(tenant_id);
    if !ctx.tenants.plugin_enabled(&tenant, name) {
        return Err(ToolError::permission_denied(format!(
            "plugin {name} is not enabled for tenant {}",
            tenant.id
        )));
    }

    // Bulkhead per upstream: one hot integration cannot starve the others.
    let key = RateLimiter::upstream_key(&tenant.id, name);
    ctx.limiter.acquire(&key, tenant.tier.limits()).await?;

    ctx.plugins.get(name)
}

pub struct PluginCapabilitiesTool;

#[async_trait]
impl Tool for PluginCapabilitiesTool {
    fn name(&self) -> &'static str {
        "plugin_capabilities"
    }

    fn description(&self) -> &'static str {
        "List registered integration adapters and their capabilities"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let entries: Vec<Value> = ctx
            .plugins
            .capability_map()
            .into_iter()
            .map(|(name, caps)| json!({ "name": name, "capabilities": caps }))
            .collect();
        Ok(json!({ "plugins": entries }))
    }
}

#[derive(Debug, Deserialize)]
struct OrdersArgs {
    plugin: String,
    #[serde(flatten)]
    query: OrderQuery,
    #[serde(default)]
    tenant: Option<String>,
}

pub struct PluginOrdersTool;

#[async_trait]
impl Tool for PluginOrdersTool {
    fn name(&self) -> &'static str {
        "plugin_orders"
    }

    fn description(&self) -> &'static str {
        "Fetch orders from an upstream integration"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plugin": { "type": "string" },
                "since": { "type": "string" },
                "status": { "type": "string" },
                "limit": { "type": "integer", "default": 50 },
                "tenant": { "type": "string" }
            },
            "required": ["plugin"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: OrdersArgs = serde_json::from_value(args)?;
        let plugin = gated_plugin(ctx, &parsed.plugin, parsed.tenant.as_deref()).await?;
        let orders = plugin.get_orders(parsed.query).await?;
        Ok(json!({ "orders": orders }))
    }
}

#[derive(Debug, Deserialize)]
struct ProductsArgs {
    plugin: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    tenant: Option<String>,
}

fn default_limit() -> usize {
    50
}

pub struct PluginProductsTool;

#[async_trait]
impl Tool for PluginProductsTool {
    fn name(&self) -> &'static str {
        "plugin_products"
    }

    fn description(&self) -> &'static str {
        "Fetch products from an upstream integration"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plugin": { "type": "string" },
                "limit": { "type": "integer", "default": 50 },
                "tenant": { "type": "string" }
            },
            "required": ["plugin"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: ProductsArgs = serde_json::from_value(args)?;
        let plugin = gated_plugin(ctx, &parsed.plugin, parsed.tenant.as_deref()).await?;
        let products = plugin.get_products(parsed.limit).await?;
        Ok(json!({ "products": products }))
    }
}

#[derive(Debug, Deserialize)]
struct CreateLabelArgs {
    plugin: String,
    #[serde(flatten)]
    request: LabelRequest,
    #[serde(default)]
    tenant: Option<String>,
}

pub struct PluginCreateLabelTool;

#[async_trait]
impl Tool for PluginCreateLabelTool {
    fn name(&self) -> &'static str {
        "plugin_create_label"
    }

    fn description(&self) -> &'static str {
        "Create a shipping label via an upstream integration"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plugin": { "type": "string" },
                "order_id": { "type": "string" },
                "carrier": { "type": "string" },
                "service": { "type": "string" },
                "tenant": { "type": "string" }
            },
            "required": ["plugin", "order_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: CreateLabelArgs = serde_json::from_value(args)?;
        let plugin = gated_plugin(ctx, &parsed.plugin, parsed.tenant.as_deref()).await?;
        let label = plugin.create_label(parsed.request).await?;
        Ok(json!({ "label": label }))
    }
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceArgs {
    plugin: String,
    #[serde(flatten)]
    request: InvoiceRequest,
    #[serde(default)]
    tenant: Option<String>,
}

pub struct PluginCreateInvoiceTool;

#[async_trait]
impl Tool for PluginCreateInvoiceTool {
    fn name(&self) -> &'static str {
        "plugin_create_invoice"
    }

    fn description(&self) -> &'static str {
        "Create an invoice via an upstream integration"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plugin": { "type": "string" },
                "customer_id": { "type": "string" },
                "amount": { "type": "number" },
                "currency": { "type": "string" },
                "memo": { "type": "string" },
                "tenant": { "type": "string" }
            },
            "required": ["plugin", "customer_id", "amount", "currency"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: CreateInvoiceArgs = serde_json::from_value(args)?;
        let plugin = gated_plugin(ctx, &parsed.plugin, parsed.tenant.as_deref()).await?;
        let invoice = plugin.create_invoice(parsed.request).await?;
        Ok(json!({ "invoice": invoice }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_args_flatten() {
        let args: OrdersArgs = serde_json::from_value(json!({
            "plugin": "shopify",
            "status": "open",
            "limit": 10
        }))
        .unwrap();
        assert_eq!(args.plugin, "shopify");
        assert_eq!(args.query.status.as_deref(), Some("open"));
        assert_eq!(args.query.limit, 10);
    }
}
