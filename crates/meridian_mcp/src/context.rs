//! Server context: every subsystem, explicitly constructed and threaded
//! through handlers. No global mutable state.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use meridian_automation::{InspectorProxy, RunnerSupervisor};
use meridian_cache::{InMemoryStore, QueryCache};
use meridian_db::{ConnectionManager, TransactionRegistry};
use meridian_policy::{
    local_time_of_day, AuditLog, CommandRequest, ConfirmationManager, Decision, PolicyDefaults,
    PolicyEngine, RiskLevel,
};
use meridian_protocol::{ToolError, ToolResult};
use meridian_tenancy::{PluginRegistry, RateLimiter, TenantRegistry};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::Config;
use crate::home::HomeGraph;
use crate::hub::SubscriptionHub;
use crate::metrics::Metrics;

/// Verdict of the policy gate for one tool call.
pub enum Authorization {
    /// Proceed. `modified_value` is set when a MODIFY policy clamped the
    /// command's numeric value.
    Allowed {
        modified_value: Option<f64>,
        confirmed_by: Option<String>,
        risk: RiskLevel,
        decision: Decision,
    },
    /// Do not execute; return this payload (it carries the token).
    Pending(Value),
}

/// Shared state for every tool handler.
pub struct ServerContext {
    pub config: Config,
    pub connections: ConnectionManager,
    pub cache: QueryCache,
    pub transactions: TransactionRegistry,
    pub policies: PolicyEngine,
    pub confirmations: ConfirmationManager,
    pub audit: AuditLog,
    pub tenants: TenantRegistry,
    pub limiter: RateLimiter,
    pub plugins: PluginRegistry,
    pub hub: Arc<SubscriptionHub>,
    pub home: HomeGraph,
    pub runner: RunnerSupervisor,
    pub inspector: InspectorProxy,
    pub metrics: Metrics,
    pub started_at: Instant,
}

impl ServerContext {
    /// Build the full context. Fatal errors here stop startup; a database
    /// that is merely down is not fatal (connections can be added later).
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let connections = ConnectionManager::new(config.pool.clone());

        if let Some(url) = &config.database_url {
            match connections.add_connection(url, Some("primary".to_string())).await {
                Ok(id) => info!("connected to configured database as {}", id),
                Err(err) => warn!("configured database unavailable at startup: {}", err),
            }
        }

        let cache = QueryCache::new(config.cache.clone(), Some(Arc::new(InMemoryStore::new())));
        let audit = AuditLog::new(config.audit_capacity, config.audit_file.clone())?;
        let hub = Arc::new(SubscriptionHub::new(
            config.subscription_buffer,
            config.subscription_stall,
        ));

        let home_layout = meridian_logging::meridian_home().join("home_layout.json");
        let home = HomeGraph::from_layout_file(&home_layout);

        let ctx = Self {
            connections,
            cache,
            transactions: TransactionRegistry::new(config.transaction_ttl),
            policies: PolicyEngine::new(PolicyDefaults::default()),
            confirmations: ConfirmationManager::new(
                config.confirmation_capacity,
                config.confirmation_ttl,
            ),
            audit,
            tenants: TenantRegistry::new(config.default_tier),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            plugins: PluginRegistry::new(),
            hub,
            home,
            runner: RunnerSupervisor::new(config.runner.clone()),
            inspector: InspectorProxy::new(config.inspector.clone()),
            metrics: Metrics::new(),
            started_at: Instant::now(),
            config,
        };

        Ok(Arc::new(ctx))
    }

    /// Policy gate for a mutating command.
    ///
    /// A confirmation token short-circuits evaluation: consuming it proves
    /// the command was already approved. Otherwise the engine decides, and a
    /// REQUIRE_CONFIRMATION verdict stashes the command and returns the
    /// token payload instead of executing.
    pub fn authorize(
        &self,
        tool: &str,
        cmd: CommandRequest,
        confirmation_token: Option<&str>,
        pin: Option<&str>,
        args_snapshot: &Value,
    ) -> ToolResult<Authorization> {
        if let Some(token) = confirmation_token {
            let pending = self.confirmations.consume(token, pin)?;
            if pending.tool != tool {
                return Err(ToolError::failed_precondition(format!(
                    "confirmation token was issued for {}, not {tool}",
                    pending.tool
                )));
            }
            return Ok(Authorization::Allowed {
                modified_value: None,
                confirmed_by: Some("client".to_string()),
                risk: pending.risk,
                decision: Decision::Allow,
            });
        }

        let evaluation = self.policies.evaluate(&cmd, local_time_of_day());
        match evaluation.decision {
            Decision::Deny => {
                Metrics::inc(&self.metrics.policy_denials);
                self.audit.record(
                    tool,
                    &cmd.target,
                    args_snapshot.clone(),
                    Decision::Deny,
                    evaluation.risk,
                    false,
                    Some(evaluation.reason.clone()),
                    None,
                );
                Err(ToolError::permission_denied(format!(
                    "denied by policy: {}",
                    evaluation.reason
                )))
            }
            Decision::RequireConfirmation => {
                Metrics::inc(&self.metrics.confirmations_issued);
                let token = self.confirmations.create(
                    tool,
                    args_snapshot.clone(),
                    evaluation.risk,
                    evaluation.confirmation_pin.clone(),
                )?;
                self.audit.record(
                    tool,
                    &cmd.target,
                    args_snapshot.clone(),
                    Decision::RequireConfirmation,
                    evaluation.risk,
                    false,
                    None,
                    None,
                );
                Ok(Authorization::Pending(json!({
                    "decision": "REQUIRE_CONFIRMATION",
                    "confirmationToken": token,
                    "risk": evaluation.risk,
                    "reason": evaluation.reason,
                })))
            }
            decision => Ok(Authorization::Allowed {
                modified_value: evaluation.modified_value,
                confirmed_by: None,
                risk: evaluation.risk,
                decision,
            }),
        }
    }

    /// Record the outcome of an executed, policy-gated command.
    #[allow(clippy::too_many_arguments)]
    pub fn audit_exec(
        &self,
        tool: &str,
        target: &str,
        command: Value,
        risk: RiskLevel,
        success: bool,
        error: Option<String>,
        confirmed_by: Option<String>,
    ) {
        self.audit.record(
            tool,
            target,
            command,
            Decision::Allow,
            risk,
            success,
            error,
            confirmed_by,
        );
    }

    /// Resolve the pool for a request, honoring per-tenant overrides.
    pub fn pool_for(&self, tenant_id: Option<&str>) -> ToolResult<Arc<meridian_db::ManagedPool>> {
        let tenant = self.tenants.resolve(tenant_id);
        self.connections
            .resolve(tenant.connection_override.as_deref())
            .map_err(ToolError::from)
    }

    /// Graceful shutdown in dependency order: subscriptions, pools,
    /// supervised subprocesses.
    pub async fn shutdown(&self) {
        info!("shutting down: closing subscriptions");
        self.hub.shutdown().await;
        info!("shutting down: closing connection pools");
        self.connections.shutdown().await;
        info!("shutting down: terminating supervised processes");
        self.runner.shutdown().await;
        self.inspector.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn test_ctx() -> Arc<ServerContext> {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config::for_tests(temp.path());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(ServerContext::new(config)).unwrap()
    }

    fn unlock_cmd() -> CommandRequest {
        CommandRequest {
            tool: "home_unlock".into(),
            action: "unlock".into(),
            target: "door_front".into(),
            tags: vec![],
            area: None,
            tenant: None,
            value: None,
            fields: Map::new(),
        }
    }

    #[test]
    fn test_high_risk_flow_issues_token_then_allows() {
        let ctx = test_ctx();
        let args = json!({"device_id": "door_front"});

        let auth = ctx
            .authorize("home_unlock", unlock_cmd(), None, None, &args)
            .unwrap();
        let token = match auth {
            Authorization::Pending(payload) => {
                assert_eq!(payload["decision"], "REQUIRE_CONFIRMATION");
                payload["confirmationToken"].as_str().unwrap().to_string()
            }
            _ => panic!("expected pending"),
        };

        // Audit recorded the pending decision.
        assert_eq!(ctx.audit.len(), 1);

        let auth = ctx
            .authorize("home_unlock", unlock_cmd(), Some(&token), None, &args)
            .unwrap();
        match auth {
            Authorization::Allowed { confirmed_by, .. } => {
                assert_eq!(confirmed_by.as_deref(), Some("client"));
            }
            _ => panic!("expected allowed"),
        }

        // Re-use of the token fails.
        let err = ctx
            .authorize("home_unlock", unlock_cmd(), Some(&token), None, &args)
            .unwrap_err();
        assert_eq!(err.code, meridian_protocol::ErrorCode::NotFound);
    }

    #[test]
    fn test_token_bound_to_tool() {
        let ctx = test_ctx();
        let args = json!({});
        let token = match ctx
            .authorize("home_unlock", unlock_cmd(), None, None, &args)
            .unwrap()
        {
            Authorization::Pending(payload) => {
                payload["confirmationToken"].as_str().unwrap().to_string()
            }
            _ => panic!("expected pending"),
        };

        let err = ctx
            .authorize("db_execute", unlock_cmd(), Some(&token), None, &args)
            .unwrap_err();
        assert_eq!(err.code, meridian_protocol::ErrorCode::FailedPrecondition);
    }
}
