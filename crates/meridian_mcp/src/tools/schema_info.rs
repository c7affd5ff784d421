//! Schema introspection tools, composed over the query layer.

use async_trait::async_trait;
use meridian_db as db;
use meridian_protocol::ToolResult;
use serde::Deserialize;
use serde_json::{json, Value};

use super::Tool;
use crate::context::ServerContext;

pub struct DbSchemaTablesTool;

#[derive(Debug, Deserialize)]
struct TablesArgs {
    #[serde(default = "default_schema")]
    schema: String,
    #[serde(default)]
    tenant: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

#[async_trait]
impl Tool for DbSchemaTablesTool {
    fn name(&self) -> &'static str {
        "db_schema_tables"
    }

    fn description(&self) -> &'static str {
        "List tables and views in a schema"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "schema": { "type": "string", "default": "public" },
                "tenant": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: TablesArgs = serde_json::from_value(args)?;
        let pool = ctx.pool_for(parsed.tenant.as_deref())?;

        let output = db::run_query(
            pool.pool(),
            "SELECT table_name, table_type FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
            &[Value::String(parsed.schema.clone())],
            &Default::default(),
        )
        .await?;

        Ok(json!({ "schema": parsed.schema, "tables": output.rows }))
    }
}

pub struct DbSchemaDescribeTool;

#[derive(Debug, Deserialize)]
struct DescribeArgs {
    table: String,
    #[serde(default = "default_schema")]
    schema: String,
    #[serde(default)]
    tenant: Option<String>,
}

#[async_trait]
impl Tool for DbSchemaDescribeTool {
    fn name(&self) -> &'static str {
        "db_schema_describe"
    }

    fn description(&self) -> &'static str {
        "Columns, types, nullability and defaults for one table"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string" },
                "schema": { "type": "string", "default": "public" },
                "tenant": { "type": "string" }
            },
            "required": ["table"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: DescribeArgs = serde_json::from_value(args)?;
        let pool = ctx.pool_for(parsed.tenant.as_deref())?;

        let columns = db::run_query(
            pool.pool(),
            "SELECT column_name, data_type, is_nullable, column_default, ordinal_position \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
            &[
                Value::String(parsed.schema.clone()),
                Value::String(parsed.table.clone()),
            ],
            &Default::default(),
        )
        .await?;

        let constraints = db::run_query(
            pool.pool(),
            "SELECT constraint_name, constraint_type FROM information_schema.table_constraints \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY constraint_name",
            &[
                Value::String(parsed.schema.clone()),
                Value::String(parsed.table.clone()),
            ],
            &Default::default(),
        )
        .await?;

        Ok(json!({
            "schema": parsed.schema,
            "table": parsed.table,
            "columns": columns.rows,
            "constraints": constraints.rows,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn test_describe_requires_table() {
        let tool = DbSchemaDescribeTool;
        assert!(schema::validate(&tool.input_schema(), &json!({})).is_err());
        assert!(schema::validate(&tool.input_schema(), &json!({ "table": "orders" })).is_ok());
    }
}
