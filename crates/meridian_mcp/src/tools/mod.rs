//! Tool implementations.
//!
//! Tool families by prefix:
//!
//! - `db_*` — connections, queries, schema, data, migrations, subscriptions
//! - `code_*` — the code-API evaluator
//! - `skill_*` — deterministic skills
//! - `home_*` — home automation (policy-gated)
//! - `ios_*` — simulator and inspector automation
//! - `plugin_*` — upstream integrations (token-gated at registration)
//! - `server_*` — introspection
//!
//! Registration order is fixed at startup; the registry closes before the
//! dispatcher serves its first request.

mod admin;
mod code_api;
mod data;
mod home_tools;
mod ios;
mod plugins_tool;
mod query;
mod schema_info;
mod server_tools;
mod skills_tool;
mod subscribe;

pub use super::registry::{Tool, ToolRegistry};

use std::sync::Arc;

use crate::config::{Config, ServerMode};

/// Build the registry for the configured mode.
///
/// Tools mode exposes the full direct surface. Code-API mode exposes the
/// single execution tool plus the connection bootstrap and catalogs it
/// needs. Integration tools register only when a token is configured.
pub fn build_registry(config: &Config) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    match config.mode {
        ServerMode::Tools => {
            registry.register(Arc::new(admin::DbConnectTool))?;
            registry.register(Arc::new(admin::DbSwitchTool))?;
            registry.register(Arc::new(admin::DbConnectionsTool))?;
            registry.register(Arc::new(admin::DbHealthTool))?;
            registry.register(Arc::new(admin::DbCacheStatsTool))?;
            registry.register(Arc::new(admin::DbCacheClearTool))?;

            registry.register(Arc::new(query::DbQueryTool))?;
            registry.register(Arc::new(query::DbExecuteTool))?;
            registry.register(Arc::new(query::DbBatchTool))?;
            registry.register(Arc::new(query::DbExplainTool))?;
            registry.register(Arc::new(query::DbTxBeginTool))?;
            registry.register(Arc::new(query::DbTxCommitTool))?;
            registry.register(Arc::new(query::DbTxRollbackTool))?;

            registry.register(Arc::new(schema_info::DbSchemaTablesTool))?;
            registry.register(Arc::new(schema_info::DbSchemaDescribeTool))?;

            registry.register(Arc::new(data::DbImportTool))?;
            registry.register(Arc::new(data::DbMigrateTool))?;
            registry.register(Arc::new(data::DbMigrateStatusTool))?;

            registry.register(Arc::new(subscribe::DbSubscribeTool))?;
            registry.register(Arc::new(subscribe::DbSubscriptionPollTool))?;
            registry.register(Arc::new(subscribe::DbUnsubscribeTool))?;

            registry.register(Arc::new(code_api::CodeRunTool))?;
            registry.register(Arc::new(skills_tool::SkillCatalogTool))?;
            registry.register(Arc::new(skills_tool::SkillRunTool))?;

            registry.register(Arc::new(home_tools::HomeDevicesTool))?;
            registry.register(Arc::new(home_tools::HomeDeviceCommandTool))?;
            registry.register(Arc::new(home_tools::HomeLockTool))?;
            registry.register(Arc::new(home_tools::HomeUnlockTool))?;
            registry.register(Arc::new(home_tools::HomeThermostatTool))?;
            registry.register(Arc::new(home_tools::HomeSceneTool))?;
            registry.register(Arc::new(home_tools::HomeAuditTool))?;

            registry.register(Arc::new(ios::IosDevicesTool))?;
            registry.register(Arc::new(ios::IosBootTool))?;
            registry.register(Arc::new(ios::IosTapTool))?;
            registry.register(Arc::new(ios::IosSwipeTool))?;
            registry.register(Arc::new(ios::IosTypeTextTool))?;
            registry.register(Arc::new(ios::IosPressButtonTool))?;
            registry.register(Arc::new(ios::IosPageSourceTool))?;
            registry.register(Arc::new(ios::IosAppLaunchTool))?;
            registry.register(Arc::new(ios::IosAppTerminateTool))?;
            registry.register(Arc::new(ios::IosInspectorTargetsTool))?;
            registry.register(Arc::new(ios::IosInspectorEvaluateTool))?;
            registry.register(Arc::new(ios::IosInspectorScreenshotTool))?;

            let tokens = &config.tokens;
            if tokens.shopify.is_some()
                || tokens.amazon.is_some()
                || tokens.fedex.is_some()
                || tokens.quickbooks.is_some()
            {
                registry.register(Arc::new(plugins_tool::PluginCapabilitiesTool))?;
                registry.register(Arc::new(plugins_tool::PluginOrdersTool))?;
                registry.register(Arc::new(plugins_tool::PluginProductsTool))?;
                registry.register(Arc::new(plugins_tool::PluginCreateLabelTool))?;
                registry.register(Arc::new(plugins_tool::PluginCreateInvoiceTool))?;
            }

            registry.register(Arc::new(server_tools::ServerStatsTool))?;
        }
        ServerMode::CodeApi => {
            registry.register(Arc::new(code_api::CodeRunTool))?;
            registry.register(Arc::new(skills_tool::SkillCatalogTool))?;
            registry.register(Arc::new(admin::DbConnectTool))?;
            registry.register(Arc::new(admin::DbSwitchTool))?;
            registry.register(Arc::new(server_tools::ServerStatsTool))?;
        }
    }

    Ok(registry)
}

/// Shared health report, reused by the db://health resource.
pub use admin::health_report;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_tools_mode_registers_full_surface() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = Config::for_tests(temp.path());
        config.mode = ServerMode::Tools;

        let registry = build_registry(&config).unwrap();
        for name in [
            "db_connect",
            "db_query",
            "db_execute",
            "db_batch",
            "db_explain",
            "db_tx_begin",
            "db_schema_tables",
            "db_import",
            "db_migrate",
            "db_subscribe",
            "db_subscription_poll",
            "db_unsubscribe",
            "code_run",
            "skill_run",
            "home_unlock",
            "home_thermostat_set",
            "ios_tap",
            "ios_page_source",
            "server_stats",
        ] {
            assert!(registry.has_tool(name), "missing tool {name}");
        }

        // Integration tools stay hidden without tokens.
        assert!(!registry.has_tool("plugin_orders"));
    }

    #[test]
    fn test_code_api_mode_is_minimal() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = Config::for_tests(temp.path());
        config.mode = ServerMode::CodeApi;

        let registry = build_registry(&config).unwrap();
        assert!(registry.has_tool("code_run"));
        assert!(!registry.has_tool("db_query"));
        assert!(!registry.has_tool("home_unlock"));
        assert!(registry.len() <= 6);
    }

    #[test]
    fn test_tokens_enable_plugin_tools() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = Config::for_tests(temp.path());
        config.mode = ServerMode::Tools;
        config.tokens.shopify = Some("tok".into());

        let registry = build_registry(&config).unwrap();
        assert!(registry.has_tool("plugin_orders"));
        assert!(registry.has_tool("plugin_create_label"));
    }
}
