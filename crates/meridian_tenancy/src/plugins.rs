//! Integration plugin contract.
//!
//! Upstream commerce and logistics integrations implement one typed trait.
//! Each adapter implements only the subset it supports and declares its
//! capabilities; calling an undeclared operation fails with
//! FAILED_PRECONDITION before any network traffic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meridian_protocol::{ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Operations an adapter can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCapability {
    Orders,
    Products,
    Labels,
    Invoices,
}

/// Filter for order listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderQuery {
    pub since: Option<DateTime<Utc>>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: String,
    pub total: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub sku: Option<String>,
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelRequest {
    pub order_id: String,
    pub carrier: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingLabel {
    pub id: String,
    pub tracking_number: String,
    pub carrier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceRequest {
    pub customer_id: String,
    pub amount: f64,
    pub currency: String,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub status: String,
    pub amount: f64,
}

fn unsupported(plugin: &str, capability: PluginCapability) -> ToolError {
    ToolError::failed_precondition(format!(
        "plugin {plugin} does not support {capability:?}"
    ))
}

/// The uniform adapter contract. Default bodies reject undeclared
/// operations so adapters only write what they support.
#[async_trait]
pub trait IntegrationPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[PluginCapability];

    fn supports(&self, capability: PluginCapability) -> bool {
        self.capabilities().contains(&capability)
    }

    async fn get_orders(&self, _query: OrderQuery) -> ToolResult<Vec<Order>> {
        Err(unsupported(self.name(), PluginCapability::Orders))
    }

    async fn get_products(&self, _limit: usize) -> ToolResult<Vec<Product>> {
        Err(unsupported(self.name(), PluginCapability::Products))
    }

    async fn create_label(&self, _request: LabelRequest) -> ToolResult<ShippingLabel> {
        Err(unsupported(self.name(), PluginCapability::Labels))
    }

    async fn create_invoice(&self, _request: InvoiceRequest) -> ToolResult<Invoice> {
        Err(unsupported(self.name(), PluginCapability::Invoices))
    }
}

/// Registry of enabled adapters. Adapters whose integration token is absent
/// are never registered, which in turn hides their tools.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn IntegrationPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn IntegrationPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> ToolResult<Arc<dyn IntegrationPlugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("no such plugin: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Listing of plugin name -> declared capabilities.
    pub fn capability_map(&self) -> Vec<(String, Vec<PluginCapability>)> {
        let mut entries: Vec<(String, Vec<PluginCapability>)> = self
            .plugins
            .values()
            .map(|p| (p.name().to_string(), p.capabilities().to_vec()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::ErrorCode;

    struct OrdersOnly;

    #[async_trait]
    impl IntegrationPlugin for OrdersOnly {
        fn name(&self) -> &str {
            "orders_only"
        }

        fn capabilities(&self) -> &[PluginCapability] {
            &[PluginCapability::Orders]
        }

        async fn get_orders(&self, query: OrderQuery) -> ToolResult<Vec<Order>> {
            Ok(vec![Order {
                id: "o1".into(),
                status: query.status.unwrap_or_else(|| "open".into()),
                total: 19.99,
                currency: "USD".into(),
                created_at: Utc::now(),
            }])
        }
    }

    #[tokio::test]
    async fn test_supported_operation() {
        let plugin = OrdersOnly;
        assert!(plugin.supports(PluginCapability::Orders));
        let orders = plugin.get_orders(OrderQuery::default()).await.unwrap();
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_operation_rejected() {
        let plugin = OrdersOnly;
        assert!(!plugin.supports(PluginCapability::Invoices));
        let err = plugin
            .create_invoice(InvoiceRequest {
                customer_id: "c1".into(),
                amount: 10.0,
                currency: "USD".into(),
                memo: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(OrdersOnly));

        assert!(registry.get("orders_only").is_ok());
        assert_eq!(
            registry.get("missing").unwrap_err().code,
            ErrorCode::NotFound
        );
        assert_eq!(registry.names(), vec!["orders_only".to_string()]);
    }
}
