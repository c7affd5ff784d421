//! Bulk import and migration tools.

use async_trait::async_trait;
use meridian_db::{self as db, migrate};
use meridian_protocol::{ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use super::Tool;
use crate::context::ServerContext;

const MAX_BATCH: usize = 500;

pub struct DbImportTool;

#[derive(Debug, Deserialize)]
struct ImportArgs {
    table: String,
    columns: Vec<String>,
    /// Inline rows; loaded with parameterized INSERT batches.
    #[serde(default)]
    rows: Vec<Vec<Value>>,
    /// Inline CSV; loaded with COPY.
    #[serde(default)]
    csv: Option<String>,
    /// Path to a CSV file; loaded with COPY.
    #[serde(default)]
    file: Option<String>,
    #[serde(default = "default_batch")]
    batch_size: usize,
    #[serde(default)]
    tenant: Option<String>,
}

fn default_batch() -> usize {
    200
}

fn quote_ident(name: &str) -> ToolResult<String> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(ToolError::invalid_argument(format!(
            "bad identifier: {name}"
        )));
    }
    Ok(format!("\"{name}\""))
}

/// Build one multi-row parameterized INSERT for a batch.
fn insert_statement(table: &str, columns: &[String], batch_len: usize) -> ToolResult<String> {
    let table = quote_ident(table)?;
    let quoted: Vec<String> = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<ToolResult<_>>()?;

    let mut placeholders = Vec::with_capacity(batch_len);
    let mut n = 1;
    for _ in 0..batch_len {
        let row: Vec<String> = (0..columns.len())
            .map(|_| {
                let p = format!("${n}");
                n += 1;
                p
            })
            .collect();
        placeholders.push(format!("({})", row.join(", ")));
    }

    Ok(format!(
        "INSERT INTO {table} ({}) VALUES {}",
        quoted.join(", "),
        placeholders.join(", ")
    ))
}

#[async_trait]
impl Tool for DbImportTool {
    fn name(&self) -> &'static str {
        "db_import"
    }

    fn description(&self) -> &'static str {
        "Batched parameterized insert; reports the first failing row"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string" },
                "columns": { "type": "array", "items": { "type": "string" } },
                "rows": { "type": "array", "description": "Inline rows (INSERT path)" },
                "csv": { "type": "string", "description": "Inline CSV (COPY path)" },
                "file": { "type": "string", "description": "CSV file path (COPY path)" },
                "batch_size": { "type": "integer", "default": 200, "maximum": 500 },
                "tenant": { "type": "string" }
            },
            "required": ["table", "columns"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: ImportArgs = serde_json::from_value(args)?;
        if parsed.columns.is_empty() {
            return Err(ToolError::invalid_argument("columns must not be empty"));
        }

        // CSV sources bulk-load through COPY; row sources use INSERT below.
        let csv = match (&parsed.csv, &parsed.file) {
            (Some(_), Some(_)) => {
                return Err(ToolError::invalid_argument(
                    "provide csv or file, not both",
                ));
            }
            (Some(inline), None) => Some(inline.clone()),
            (None, Some(path)) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ToolError::invalid_argument(format!("unreadable file: {e}")))?,
            ),
            (None, None) => None,
        };

        if let Some(csv) = csv {
            if !parsed.rows.is_empty() {
                return Err(ToolError::invalid_argument(
                    "provide rows or a CSV source, not both",
                ));
            }
            let table = quote_ident(&parsed.table)?;
            let columns: Vec<String> = parsed
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<ToolResult<_>>()?;
            let pool = ctx.pool_for(parsed.tenant.as_deref())?;
            let loaded = db::copy_in_csv(pool.pool(), &table, &columns, &csv).await?;
            return Ok(json!({ "inserted": loaded, "method": "copy" }));
        }

        if parsed.rows.is_empty() {
            return Err(ToolError::invalid_argument(
                "provide rows, csv, or file to import",
            ));
        }
        for (idx, row) in parsed.rows.iter().enumerate() {
            if row.len() != parsed.columns.len() {
                return Err(ToolError::invalid_argument(format!(
                    "row {idx} has {} values, expected {}",
                    row.len(),
                    parsed.columns.len()
                )));
            }
        }

        let batch_size = parsed.batch_size.clamp(1, MAX_BATCH);
        let pool = ctx.pool_for(parsed.tenant.as_deref())?;

        let mut inserted = 0usize;
        for (batch_index, batch) in parsed.rows.chunks(batch_size).enumerate() {
            let sql = insert_statement(&parsed.table, &parsed.columns, batch.len())?;
            let params: Vec<Value> = batch.iter().flatten().cloned().collect();

            if let Err(err) =
                db::run_execute(pool.pool(), &sql, &params, &Default::default()).await
            {
                let tool_err: ToolError = err.into();
                return Err(tool_err.with_details(json!({
                    "inserted": inserted,
                    "first_failing_row": batch_index * batch_size,
                })));
            }
            inserted += batch.len();
        }

        Ok(json!({
            "inserted": inserted,
            "method": "insert",
            "batches": parsed.rows.len().div_ceil(batch_size),
        }))
    }
}

pub struct DbMigrateTool;

#[derive(Debug, Deserialize)]
struct MigrateArgs {
    #[serde(default)]
    directory: Option<String>,
    #[serde(default)]
    tenant: Option<String>,
}

#[async_trait]
impl Tool for DbMigrateTool {
    fn name(&self) -> &'static str {
        "db_migrate"
    }

    fn description(&self) -> &'static str {
        "Apply pending migrations in lexicographic order"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "directory": { "type": "string" },
                "tenant": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: MigrateArgs = serde_json::from_value(args)?;
        let dir = parsed
            .directory
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.config.migrations_dir.clone());

        let pool = ctx.pool_for(parsed.tenant.as_deref())?;
        let pg_pool = pool.pool().clone();
        let report = migrate::apply(&pg_pool, &dir).await?;
        Ok(serde_json::to_value(report).unwrap_or(Value::Null))
    }
}

pub struct DbMigrateStatusTool;

#[async_trait]
impl Tool for DbMigrateStatusTool {
    fn name(&self) -> &'static str {
        "db_migrate_status"
    }

    fn description(&self) -> &'static str {
        "Report applied and pending migrations"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "directory": { "type": "string" },
                "tenant": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: MigrateArgs = serde_json::from_value(args)?;
        let dir = parsed
            .directory
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.config.migrations_dir.clone());

        let pool = ctx.pool_for(parsed.tenant.as_deref())?;
        let pg_pool = pool.pool().clone();
        let status = migrate::status(&pg_pool, &dir).await?;
        Ok(json!({ "migrations": status }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_statement_shape() {
        let sql = insert_statement(
            "orders",
            &["id".to_string(), "amount".to_string()],
            2,
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"orders\" (\"id\", \"amount\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_identifiers_validated() {
        assert!(quote_ident("orders").is_ok());
        assert!(quote_ident("order_items2").is_ok());
        assert!(quote_ident("orders; DROP TABLE x").is_err());
        assert!(quote_ident("2fast").is_err());
        assert!(quote_ident("").is_err());
    }
}
