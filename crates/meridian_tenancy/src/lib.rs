//! Multi-tenant registry, rate limiting, and the integration plugin
//! contract.
//!
//! Tenants map to tiers; tiers map to token-bucket limits. Per-tenant
//! connection overrides are consulted by the connection manager when a
//! request names its tenant.

pub mod plugins;
pub mod ratelimit;

pub use plugins::{
    IntegrationPlugin, Invoice, InvoiceRequest, LabelRequest, Order, OrderQuery,
    PluginCapability, PluginRegistry, Product, ShippingLabel,
};
pub use ratelimit::{BucketLimits, RateLimiter, RateLimiterConfig};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Service tiers and their bucket limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Standard,
    Premium,
    Enterprise,
}

impl Tier {
    /// Token-bucket limits for tool entry at this tier.
    pub fn limits(self) -> BucketLimits {
        match self {
            Self::Free => BucketLimits {
                capacity: 10.0,
                refill_per_sec: 0.5,
            },
            Self::Standard => BucketLimits {
                capacity: 60.0,
                refill_per_sec: 5.0,
            },
            Self::Premium => BucketLimits {
                capacity: 240.0,
                refill_per_sec: 20.0,
            },
            Self::Enterprise => BucketLimits {
                capacity: 1000.0,
                refill_per_sec: 100.0,
            },
        }
    }
}

/// A registered tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub tier: Tier,
    /// Plugins this tenant may use. Empty means all registered plugins.
    #[serde(default)]
    pub enabled_plugins: Vec<String>,
    /// Connection id consulted instead of the active pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_override: Option<String>,
}

/// Tenant id used when a request carries none.
pub const DEFAULT_TENANT: &str = "default";

/// Registry of tenants. Unknown tenants resolve to the default tier.
pub struct TenantRegistry {
    tenants: DashMap<String, Tenant>,
    default_tier: Tier,
}

impl TenantRegistry {
    pub fn new(default_tier: Tier) -> Self {
        Self {
            tenants: DashMap::new(),
            default_tier,
        }
    }

    pub fn upsert(&self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    /// Resolve a tenant id (or the default) to its effective settings.
    pub fn resolve(&self, id: Option<&str>) -> Tenant {
        let id = id.unwrap_or(DEFAULT_TENANT);
        self.tenants
            .get(id)
            .map(|t| t.clone())
            .unwrap_or_else(|| Tenant {
                id: id.to_string(),
                tier: self.default_tier,
                enabled_plugins: Vec::new(),
                connection_override: None,
            })
    }

    pub fn plugin_enabled(&self, tenant: &Tenant, plugin: &str) -> bool {
        tenant.enabled_plugins.is_empty()
            || tenant.enabled_plugins.iter().any(|p| p == plugin)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
