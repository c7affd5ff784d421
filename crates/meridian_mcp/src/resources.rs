//! Resource registry: readable URIs returning JSON snapshots.
//!
//! Readers are pure over the snapshot they observe and idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_db as db;
use meridian_protocol::{ResourceDefinition, ToolError, ToolResult};
use serde_json::{json, Value};

use crate::context::ServerContext;
use crate::tools::health_report;

/// One readable resource.
#[async_trait]
pub trait Resource: Send + Sync {
    fn uri(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn mime_type(&self) -> &'static str {
        "application/json"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value>;

    fn definition(&self) -> ResourceDefinition {
        ResourceDefinition {
            uri: self.uri().to_string(),
            name: self.name().to_string(),
            mime_type: self.mime_type().to_string(),
            description: None,
        }
    }
}

/// Registry of resources, fixed at startup.
pub struct ResourceRegistry {
    order: Vec<Arc<dyn Resource>>,
    by_uri: HashMap<&'static str, Arc<dyn Resource>>,
}

impl ResourceRegistry {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            by_uri: HashMap::new(),
        }
    }

    fn register(&mut self, resource: Arc<dyn Resource>) {
        self.by_uri.insert(resource.uri(), Arc::clone(&resource));
        self.order.push(resource);
    }

    pub fn list(&self) -> Vec<ResourceDefinition> {
        self.order.iter().map(|r| r.definition()).collect()
    }

    pub async fn read(&self, uri: &str, ctx: &ServerContext) -> ToolResult<(String, Value)> {
        let resource = self
            .by_uri
            .get(uri)
            .ok_or_else(|| ToolError::not_found(format!("no such resource: {uri}")))?;
        let value = resource.read(ctx).await?;
        Ok((resource.mime_type().to_string(), value))
    }
}

/// Build the resource set for the server.
pub fn build_resources() -> ResourceRegistry {
    let mut registry = ResourceRegistry::new();
    registry.register(Arc::new(DbSchemaResource));
    registry.register(Arc::new(DbConnectionsResource));
    registry.register(Arc::new(DbHealthResource));
    registry.register(Arc::new(HomeDevicesResource));
    registry.register(Arc::new(HomeAreasResource));
    registry.register(Arc::new(HomeScenesResource));
    registry.register(Arc::new(HomePolicyResource));
    registry.register(Arc::new(HomeAuditResource));
    registry
}

struct DbSchemaResource;

#[async_trait]
impl Resource for DbSchemaResource {
    fn uri(&self) -> &'static str {
        "db://schema"
    }

    fn name(&self) -> &'static str {
        "Database schema"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        let pool = ctx.pool_for(None)?;
        let output = db::run_query(
            pool.pool(),
            "SELECT table_schema, table_name, table_type FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
             ORDER BY table_schema, table_name",
            &[],
            &Default::default(),
        )
        .await?;
        Ok(json!({ "tables": output.rows }))
    }
}

struct DbConnectionsResource;

#[async_trait]
impl Resource for DbConnectionsResource {
    fn uri(&self) -> &'static str {
        "db://connections"
    }

    fn name(&self) -> &'static str {
        "Registered connections"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "connections": ctx.connections.list() }))
    }
}

struct DbHealthResource;

#[async_trait]
impl Resource for DbHealthResource {
    fn uri(&self) -> &'static str {
        "db://health"
    }

    fn name(&self) -> &'static str {
        "Server health"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(health_report(ctx).await)
    }
}

struct HomeDevicesResource;

#[async_trait]
impl Resource for HomeDevicesResource {
    fn uri(&self) -> &'static str {
        "home://devices"
    }

    fn name(&self) -> &'static str {
        "Home devices"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "devices": ctx.home.devices() }))
    }
}

struct HomeAreasResource;

#[async_trait]
impl Resource for HomeAreasResource {
    fn uri(&self) -> &'static str {
        "home://areas"
    }

    fn name(&self) -> &'static str {
        "Home areas"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "areas": ctx.home.areas() }))
    }
}

struct HomeScenesResource;

#[async_trait]
impl Resource for HomeScenesResource {
    fn uri(&self) -> &'static str {
        "home://scenes"
    }

    fn name(&self) -> &'static str {
        "Home scenes"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "scenes": ctx.home.scenes() }))
    }
}

struct HomePolicyResource;

#[async_trait]
impl Resource for HomePolicyResource {
    fn uri(&self) -> &'static str {
        "home://policy"
    }

    fn name(&self) -> &'static str {
        "Configured policies"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "policies": ctx.policies.list_policies() }))
    }
}

struct HomeAuditResource;

#[async_trait]
impl Resource for HomeAuditResource {
    fn uri(&self) -> &'static str {
        "home://audit"
    }

    fn name(&self) -> &'static str {
        "Audit log"
    }

    async fn read(&self, ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "entries": ctx.audit.recent(100) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lists_expected_uris() {
        let registry = build_resources();
        let uris: Vec<String> = registry.list().into_iter().map(|d| d.uri).collect();
        for expected in [
            "db://schema",
            "db://connections",
            "db://health",
            "home://devices",
            "home://areas",
            "home://scenes",
            "home://policy",
            "home://audit",
        ] {
            assert!(uris.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_mime_type_default() {
        let registry = build_resources();
        for definition in registry.list() {
            assert_eq!(definition.mime_type, "application/json");
        }
    }
}
