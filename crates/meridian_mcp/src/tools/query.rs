//! db_query / db_execute / db_batch / db_explain and transaction handles.

use async_trait::async_trait;
use meridian_db as db;
use meridian_policy::CommandRequest;
use meridian_protocol::{ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::Tool;
use crate::context::{Authorization, ServerContext};
use crate::dbops::{self, QueryRequest};

pub struct DbQueryTool;

#[async_trait]
impl Tool for DbQueryTool {
    fn name(&self) -> &'static str {
        "db_query"
    }

    fn description(&self) -> &'static str {
        "Run a read-only SQL statement with positional or named parameters"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "SELECT/WITH/EXPLAIN statement" },
                "params": { "description": "Positional array or named object" },
                "timeout_ms": { "type": "integer", "default": 30000 },
                "cache": { "type": "string", "enum": ["off", "read", "read-write"], "default": "off" },
                "row_limit": { "type": "integer" },
                "transaction": { "type": "string", "description": "Open transaction handle" },
                "tenant": { "type": "string" },
                "connection": { "type": "string" }
            },
            "required": ["sql"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "columns": { "type": "array" },
                "rows": { "type": "array" },
                "row_count": { "type": "integer" },
                "truncated": { "type": "boolean" },
                "elapsed_ms": { "type": "integer" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let request: QueryRequest = serde_json::from_value(args)?;
        dbops::run_query_request(ctx, &request).await
    }
}

pub struct DbExecuteTool;

#[derive(Debug, Deserialize)]
struct ExecuteArgs {
    #[serde(flatten)]
    request: QueryRequest,
    #[serde(default)]
    confirmation_token: Option<String>,
    #[serde(default)]
    pin: Option<String>,
}

#[async_trait]
impl Tool for DbExecuteTool {
    fn name(&self) -> &'static str {
        "db_execute"
    }

    fn description(&self) -> &'static str {
        "Run a mutating SQL statement (policy-gated)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string" },
                "params": { "description": "Positional array or named object" },
                "timeout_ms": { "type": "integer", "default": 30000 },
                "transaction": { "type": "string" },
                "tenant": { "type": "string" },
                "connection": { "type": "string" },
                "confirmation_token": { "type": "string" },
                "pin": { "type": "string" }
            },
            "required": ["sql"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let snapshot = args.clone();
        let parsed: ExecuteArgs = serde_json::from_value(args)?;

        let mut fields = Map::new();
        fields.insert("sql".into(), Value::String(parsed.request.sql.clone()));
        let cmd = CommandRequest {
            tool: "db_execute".into(),
            action: "execute".into(),
            target: "database".into(),
            tags: vec![],
            area: None,
            tenant: parsed.request.tenant.clone(),
            value: None,
            fields,
        };

        let auth = ctx.authorize(
            "db_execute",
            cmd,
            parsed.confirmation_token.as_deref(),
            parsed.pin.as_deref(),
            &snapshot,
        )?;
        let (risk, confirmed_by) = match auth {
            Authorization::Pending(payload) => return Ok(payload),
            Authorization::Allowed {
                risk, confirmed_by, ..
            } => (risk, confirmed_by),
        };

        let result = dbops::run_execute_request(ctx, &parsed.request).await;
        ctx.audit_exec(
            "db_execute",
            "database",
            snapshot,
            risk,
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()),
            confirmed_by,
        );

        let affected = result?;
        Ok(json!({ "rows_affected": affected }))
    }
}

pub struct DbBatchTool;

#[derive(Debug, Deserialize)]
struct BatchArgs {
    statements: Vec<BatchStatement>,
    #[serde(default)]
    tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchStatement {
    sql: String,
    #[serde(default)]
    params: Value,
}

#[async_trait]
impl Tool for DbBatchTool {
    fn name(&self) -> &'static str {
        "db_batch"
    }

    fn description(&self) -> &'static str {
        "Run statements in one transaction; all commit or all roll back"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "statements": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "sql": { "type": "string" },
                            "params": {}
                        },
                        "required": ["sql"]
                    }
                },
                "tenant": { "type": "string" }
            },
            "required": ["statements"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: BatchArgs = serde_json::from_value(args)?;
        if parsed.statements.is_empty() {
            return Err(ToolError::invalid_argument("statements must not be empty"));
        }

        let mut statements = Vec::with_capacity(parsed.statements.len());
        for statement in &parsed.statements {
            let (sql, params) = db::bind_parameters(&statement.sql, &statement.params)?;
            statements.push((sql, params));
        }

        let pool = ctx.pool_for(parsed.tenant.as_deref())?;
        match db::run_batch(pool.pool(), &statements).await {
            Ok(affected) => Ok(json!({
                "committed": true,
                "rows_affected": affected,
            })),
            Err((index, err)) => {
                let tool_err: ToolError = err.into();
                Err(tool_err.with_details(json!({ "failed_statement": index })))
            }
        }
    }
}

pub struct DbExplainTool;

#[derive(Debug, Deserialize)]
struct ExplainArgs {
    sql: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    analyze: bool,
    #[serde(default)]
    tenant: Option<String>,
}

#[async_trait]
impl Tool for DbExplainTool {
    fn name(&self) -> &'static str {
        "db_explain"
    }

    fn description(&self) -> &'static str {
        "Return the planner output for a statement, unchanged"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string" },
                "params": {},
                "analyze": { "type": "boolean", "default": false },
                "tenant": { "type": "string" }
            },
            "required": ["sql"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: ExplainArgs = serde_json::from_value(args)?;
        db::validate_read_only(&parsed.sql).map_err(ToolError::from)?;
        let (sql, params) = db::bind_parameters(&parsed.sql, &parsed.params)?;

        let pool = ctx.pool_for(parsed.tenant.as_deref())?;
        let plan = db::run_explain(
            pool.pool(),
            &sql,
            &params,
            parsed.analyze,
            &Default::default(),
        )
        .await?;
        Ok(json!({ "plan": plan }))
    }
}

pub struct DbTxBeginTool;

#[async_trait]
impl Tool for DbTxBeginTool {
    fn name(&self) -> &'static str {
        "db_tx_begin"
    }

    fn description(&self) -> &'static str {
        "Open a transaction and return its handle"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "tenant": { "type": "string" } }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let tenant = args.get("tenant").and_then(Value::as_str);
        let pool = ctx.pool_for(tenant)?;
        let id = ctx.transactions.begin(pool.pool()).await?;
        Ok(json!({ "transaction": id.to_string() }))
    }
}

pub struct DbTxCommitTool;

#[async_trait]
impl Tool for DbTxCommitTool {
    fn name(&self) -> &'static str {
        "db_tx_commit"
    }

    fn description(&self) -> &'static str {
        "Commit an open transaction"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "transaction": { "type": "string" } },
            "required": ["transaction"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let handle = args["transaction"].as_str().unwrap_or_default();
        let id = dbops::parse_tx_handle(handle)?;
        ctx.transactions.commit(id).await?;
        Ok(json!({ "committed": true }))
    }
}

pub struct DbTxRollbackTool;

#[async_trait]
impl Tool for DbTxRollbackTool {
    fn name(&self) -> &'static str {
        "db_tx_rollback"
    }

    fn description(&self) -> &'static str {
        "Roll back an open transaction"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "transaction": { "type": "string" } },
            "required": ["transaction"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let handle = args["transaction"].as_str().unwrap_or_default();
        let id = dbops::parse_tx_handle(handle)?;
        ctx.transactions.rollback(id).await?;
        Ok(json!({ "rolled_back": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn test_query_schema_gates_sql_type() {
        let tool = DbQueryTool;
        // The dispatch-level gate rejects a numeric sql before execution.
        assert!(schema::validate(&tool.input_schema(), &json!({ "sql": 123 })).is_err());
        assert!(schema::validate(&tool.input_schema(), &json!({ "sql": "SELECT 1" })).is_ok());
    }

    #[test]
    fn test_execute_args_flatten() {
        let args: ExecuteArgs = serde_json::from_value(json!({
            "sql": "UPDATE t SET x = 1",
            "confirmation_token": "tok",
        }))
        .unwrap();
        assert_eq!(args.request.sql, "UPDATE t SET x = 1");
        assert_eq!(args.confirmation_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_batch_args_parse() {
        let args: BatchArgs = serde_json::from_value(json!({
            "statements": [
                { "sql": "INSERT INTO t VALUES ($1)", "params": [1] },
                { "sql": "DELETE FROM t WHERE id = :id", "params": { "id": 2 } }
            ]
        }))
        .unwrap();
        assert_eq!(args.statements.len(), 2);
    }
}
