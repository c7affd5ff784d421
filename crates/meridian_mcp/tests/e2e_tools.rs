//! End-to-end tests for the MCP tool pipeline.
//!
//! These exercise the registry, schema gate, policy confirmation flow,
//! subscription hub, sandbox programs and skills with real state. Tests that
//! need a live database are exercised separately; everything here runs
//! self-contained.

use std::sync::Arc;

use meridian_mcp::tools::build_registry;
use meridian_mcp::{Config, ServerContext, ServerMode};
use meridian_protocol::ErrorCode;
use serde_json::json;
use tempfile::TempDir;

async fn setup() -> (TempDir, Arc<ServerContext>, meridian_mcp::tools::ToolRegistry) {
    let temp = TempDir::new().unwrap();
    let mut config = Config::for_tests(temp.path());
    config.mode = ServerMode::Tools;
    let ctx = ServerContext::new(config.clone()).await.unwrap();
    let registry = build_registry(&config).unwrap();
    (temp, ctx, registry)
}

// ============================================================================
// REGISTRY
// ============================================================================

#[tokio::test]
async fn test_registry_closed_with_unique_names() {
    let (_temp, _ctx, registry) = setup().await;

    let mut seen = std::collections::HashSet::new();
    for tool in registry.list_tools() {
        assert!(seen.insert(tool.name.clone()), "duplicate tool {}", tool.name);
        assert!(!tool.description.is_empty());
        assert_eq!(tool.input_schema["type"], "object");
    }
    assert!(seen.len() > 30);
}

#[tokio::test]
async fn test_unknown_tool_not_found() {
    let (_temp, ctx, registry) = setup().await;
    let err = registry
        .call_tool("db_nonexistent", json!({}), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

// ============================================================================
// SCHEMA GATE
// ============================================================================

#[tokio::test]
async fn test_schema_gate_rejects_before_execution() {
    let (_temp, ctx, registry) = setup().await;

    // Wrong type for sql: the executor must not run, so no connection error
    // surfaces, only INVALID_ARGUMENT.
    let err = registry
        .call_tool("db_query", json!({ "sql": 123 }), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    let err = registry
        .call_tool("db_query", json!({}), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert!(err.message.contains("sql"));
}

#[tokio::test]
async fn test_valid_args_reach_executor() {
    let (_temp, ctx, registry) = setup().await;

    // With no connection configured the executor itself reports the
    // precondition, proving the gate passed.
    let err = registry
        .call_tool("db_query", json!({ "sql": "SELECT 1 AS v" }), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::FailedPrecondition);
}

// ============================================================================
// POLICY CONFIRMATION FLOW
// ============================================================================

#[tokio::test]
async fn test_unlock_requires_then_consumes_confirmation() {
    let (_temp, ctx, registry) = setup().await;

    let pending = registry
        .call_tool("home_unlock", json!({ "device_id": "door_front" }), &ctx)
        .await
        .unwrap();
    assert_eq!(pending["decision"], "REQUIRE_CONFIRMATION");
    let token = pending["confirmationToken"].as_str().unwrap().to_string();

    // The lock did not move.
    let devices = registry.call_tool("home_devices", json!({}), &ctx).await.unwrap();
    let front = devices["devices"]
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["id"] == "door_front")
        .unwrap();
    assert_eq!(front["locked"], true);

    // Re-invocation with the token executes exactly once.
    let done = registry
        .call_tool(
            "home_unlock",
            json!({ "device_id": "door_front", "confirmation_token": token }),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(done["decision"], "ALLOW");
    assert_eq!(done["state"]["locked"], false);

    // The same token afterwards is gone.
    let err = registry
        .call_tool(
            "home_unlock",
            json!({ "device_id": "door_front", "confirmation_token": token }),
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);

    // Audit holds the pending decision and the allowed execution.
    let audit = registry
        .call_tool("home_audit", json!({}), &ctx)
        .await
        .unwrap();
    let entries = audit["entries"].as_array().unwrap();
    assert!(entries.len() >= 2);
    assert_eq!(entries[0]["decision"], "REQUIRE_CONFIRMATION");
    assert_eq!(entries[0]["risk"], "HIGH");
    let last = entries.last().unwrap();
    assert_eq!(last["decision"], "ALLOW");
    assert_eq!(last["success"], true);
    assert_eq!(last["confirmed_by"], "client");
}

#[tokio::test]
async fn test_deny_policy_blocks_executor_and_audits() {
    let (_temp, ctx, registry) = setup().await;

    ctx.policies.add_policy(meridian_policy::Policy {
        id: "deny_bedroom".into(),
        name: "no bedroom lights".into(),
        priority: 1,
        matcher: meridian_policy::PolicyMatcher {
            target: Some("light_bedroom".into()),
            ..Default::default()
        },
        decision: meridian_policy::Decision::Deny,
        risk_override: None,
        bounds: None,
        quiet_hours: None,
        condition: None,
        confirmation_pin: None,
    });

    let err = registry
        .call_tool(
            "home_device_command",
            json!({ "device_id": "light_bedroom", "action": "turn_on" }),
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);

    // Executor untouched: the light is still off.
    let device = ctx.home.device("light_bedroom").unwrap();
    assert!(!device.on);

    // And the denial is in the audit log.
    let entries = ctx.audit.recent(10);
    assert_eq!(entries.last().unwrap().decision, meridian_policy::Decision::Deny);
}

#[tokio::test]
async fn test_thermostat_bounds_modify_clamps() {
    let (_temp, ctx, registry) = setup().await;

    ctx.policies.add_policy(meridian_policy::Policy {
        id: "hvac_bounds".into(),
        name: "reasonable setpoints".into(),
        priority: 1,
        matcher: meridian_policy::PolicyMatcher {
            action: Some("set_temperature".into()),
            ..Default::default()
        },
        decision: meridian_policy::Decision::Modify,
        risk_override: None,
        bounds: Some(meridian_policy::NumericBounds {
            min: Some(55.0),
            max: Some(85.0),
        }),
        quiet_hours: None,
        condition: None,
        confirmation_pin: None,
    });

    let result = registry
        .call_tool(
            "home_thermostat_set",
            json!({ "device_id": "hvac_main", "temperature": 100.0 }),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(result["state"]["temperature"], 85.0);
    assert_eq!(result["modified_value"], 85.0);
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[tokio::test]
async fn test_subscription_overflow_and_poll() {
    let (_temp, ctx, registry) = setup().await;

    // Register directly on the hub (no database needed), then drain through
    // the polling tool.
    let id = ctx.hub.subscribe(
        vec!["home_events".into()],
        Some(2),
        meridian_mcp::hub::OverflowPolicy::DropOldest,
    );

    for n in 1..=4 {
        ctx.hub.dispatch("home_events", json!({ "n": n }));
    }

    let out = registry
        .call_tool(
            "db_subscription_poll",
            json!({ "subscription_id": id, "max_events": 10 }),
            &ctx,
        )
        .await
        .unwrap();
    let events = out["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["payload"]["n"], 3);
    assert_eq!(events[1]["payload"]["n"], 4);
    assert_eq!(out["dropped"], 2);

    // Next drain stalls: nothing buffered.
    let out = registry
        .call_tool(
            "db_subscription_poll",
            json!({ "subscription_id": id, "max_events": 10 }),
            &ctx,
        )
        .await
        .unwrap();
    assert!(out["events"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_idempotent() {
    let (_temp, ctx, registry) = setup().await;

    let id = ctx.hub.subscribe(
        vec![],
        None,
        meridian_mcp::hub::OverflowPolicy::DropOldest,
    );

    let first = registry
        .call_tool("db_unsubscribe", json!({ "subscription_id": id }), &ctx)
        .await
        .unwrap();
    assert_eq!(first["was_subscribed"], true);

    let second = registry
        .call_tool("db_unsubscribe", json!({ "subscription_id": id }), &ctx)
        .await
        .unwrap();
    assert_eq!(second["unsubscribed"], true);
    assert_eq!(second["was_subscribed"], false);
}

#[tokio::test]
async fn test_home_commands_feed_subscribers() {
    let (_temp, ctx, registry) = setup().await;

    let id = ctx.hub.subscribe(
        vec!["home_events".into()],
        None,
        meridian_mcp::hub::OverflowPolicy::DropOldest,
    );

    registry
        .call_tool(
            "home_device_command",
            json!({ "device_id": "light_living", "action": "turn_on" }),
            &ctx,
        )
        .await
        .unwrap();

    let out = ctx.hub.poll(&id, 10, None).unwrap();
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.events[0].payload["device_id"], "light_living");
    assert_eq!(out.events[0].payload["state"]["on"], true);
}

// ============================================================================
// CODE-API PROGRAMS
// ============================================================================

#[tokio::test]
async fn test_program_pipeline_skill_and_fs() {
    let (_temp, ctx, registry) = setup().await;

    let program = json!({
        "steps": [
            { "op": "data", "id": "raw", "value": [
                { "region": "east", "amount": 10 },
                { "region": "west", "amount": 30 },
                { "region": "east", "amount": 20 }
            ]},
            { "op": "pipeline", "id": "grouped", "input": "raw", "ops": [
                { "op": "group_by", "keys": ["region"], "aggregates": [
                    { "name": "total", "kind": "sum", "field": "amount" }
                ]},
                { "op": "sort", "by": "region" }
            ]},
            { "op": "skill", "id": "summary", "name": "analytics.describe", "input": "grouped" },
            { "op": "fs_write", "path": "out/summary.json", "from": "summary" },
            { "op": "fs_read", "id": "readback", "path": "out/summary.json" }
        ],
        "result": "grouped"
    });

    let out = registry
        .call_tool("code_run", json!({ "program": program }), &ctx)
        .await
        .unwrap();
    let groups = out["result"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["region"], "east");
    assert_eq!(groups[0]["total"], 30.0);
    assert_eq!(groups[1]["total"], 30.0);
}

#[tokio::test]
async fn test_program_fs_escape_rejected() {
    let (_temp, ctx, registry) = setup().await;

    let program = json!({
        "steps": [
            { "op": "data", "id": "x", "value": [{"a": 1}] },
            { "op": "fs_write", "path": "../escape.json", "from": "x" }
        ]
    });

    let err = registry
        .call_tool("code_run", json!({ "program": program }), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);
}

#[tokio::test]
async fn test_program_unknown_reference() {
    let (_temp, ctx, registry) = setup().await;

    let program = json!({
        "steps": [
            { "op": "pipeline", "id": "p", "input": "missing", "ops": [] }
        ]
    });

    let err = registry
        .call_tool("code_run", json!({ "program": program }), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

// ============================================================================
// SKILLS
// ============================================================================

#[tokio::test]
async fn test_skill_run_tool() {
    let (_temp, ctx, registry) = setup().await;

    let out = registry
        .call_tool(
            "skill_run",
            json!({
                "name": "quality.null_report",
                "input": [ { "a": 1 }, { "a": null } ]
            }),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(out["columns"]["a"]["nulls"], 1);

    let catalog = registry
        .call_tool("skill_catalog", json!({}), &ctx)
        .await
        .unwrap();
    assert!(catalog["skills"].as_array().unwrap().len() >= 4);
}

// ============================================================================
// HEALTH & STATS
// ============================================================================

#[tokio::test]
async fn test_health_and_stats_report_counters() {
    let (_temp, ctx, registry) = setup().await;

    registry
        .call_tool("home_devices", json!({}), &ctx)
        .await
        .unwrap();

    let health = registry.call_tool("db_health", json!({}), &ctx).await.unwrap();
    assert!(health["uptime_secs"].is_number());
    assert!(health["metrics"]["tool_calls"].as_u64().unwrap() >= 1);
    assert!(health["active_connection"].is_null());

    let stats = registry
        .call_tool("server_stats", json!({}), &ctx)
        .await
        .unwrap();
    assert!(stats["metrics"]["tool_calls"].as_u64().unwrap() >= 2);
}

// ============================================================================
// RATE LIMITING
// ============================================================================

#[tokio::test]
async fn test_free_tier_tenant_rate_limited() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::for_tests(temp.path());
    config.mode = ServerMode::Tools;
    // Keep the test fast: give up on a token almost immediately.
    config.rate_limit.max_wait = std::time::Duration::from_millis(20);
    let ctx = ServerContext::new(config.clone()).await.unwrap();
    let registry = build_registry(&config).unwrap();

    ctx.tenants.upsert(meridian_tenancy::Tenant {
        id: "throttled".into(),
        tier: meridian_tenancy::Tier::Free,
        enabled_plugins: vec![],
        connection_override: None,
    });

    // Free tier bursts 10; the 11th call within the window is rejected.
    let mut limited = false;
    for _ in 0..12 {
        let result = registry
            .call_tool("home_devices", json!({ "tenant": "throttled" }), &ctx)
            .await;
        if let Err(err) = result {
            assert_eq!(err.code, ErrorCode::ResourceExhausted);
            assert!(err.retry_after.is_some());
            limited = true;
            break;
        }
    }
    assert!(limited, "expected the free tier to throttle");
}
