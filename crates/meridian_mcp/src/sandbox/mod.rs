//! Code-API evaluator.
//!
//! Programs are data: a list of named steps whose only capabilities are
//! `query`, `stream_aggregate`, `pipeline`, `skill`, and jailed `fs`
//! access. Steps reference earlier results by id. There is no network,
//! timer, or subprocess surface; the suspension points are exactly the
//! awaits on these helpers.

pub mod fsjail;
pub mod pipeline;

pub use fsjail::FsJail;
pub use pipeline::PipelineOp;

use std::collections::HashMap;

use meridian_protocol::{ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::context::ServerContext;
use crate::dbops::{self, CacheMode, QueryRequest};
use crate::skills;

/// A full program.
#[derive(Debug, Deserialize)]
pub struct Program {
    pub steps: Vec<Step>,
    /// Step id whose value is the program result; defaults to the last step.
    #[serde(default)]
    pub result: Option<String>,
}

/// One step. `id` names the result for later steps.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Inline literal data, usable as input to later steps.
    Data {
        id: String,
        value: Value,
    },
    Query {
        id: String,
        sql: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        cache: CacheMode,
    },
    StreamAggregate {
        id: String,
        sql: String,
        #[serde(default)]
        params: Value,
        reducer: Reducer,
        #[serde(default)]
        batch_size: Option<usize>,
    },
    Pipeline {
        id: String,
        input: String,
        ops: Vec<PipelineOp>,
    },
    Skill {
        id: String,
        name: String,
        input: String,
    },
    FsRead {
        id: String,
        path: String,
    },
    FsWrite {
        path: String,
        from: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reducer {
    pub kind: ReducerKind,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Collect,
    Distinct,
}

struct Env {
    values: HashMap<String, Value>,
    bytes_used: usize,
    soft_limit: usize,
}

impl Env {
    fn store(&mut self, id: &str, value: Value) -> ToolResult<()> {
        // Soft memory accounting on materialized step output.
        self.bytes_used += estimate_size(&value);
        if self.bytes_used > self.soft_limit {
            return Err(ToolError::resource_exhausted(format!(
                "program exceeded memory budget ({} bytes)",
                self.soft_limit
            )));
        }
        self.values.insert(id.to_string(), value);
        Ok(())
    }

    fn get(&self, id: &str) -> ToolResult<&Value> {
        self.values
            .get(id)
            .ok_or_else(|| ToolError::invalid_argument(format!("unknown step reference: {id}")))
    }
}

fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => s.len() + 24,
        Value::Array(items) => items.iter().map(estimate_size).sum::<usize>() + 24,
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() + estimate_size(v))
            .sum::<usize>()
            + 32,
    }
}

fn rows_of(value: &Value) -> ToolResult<Vec<Map<String, Value>>> {
    // Accept either raw row arrays or a query result envelope.
    let array = match value {
        Value::Array(rows) => rows,
        Value::Object(obj) => obj
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::invalid_argument("referenced step holds no rows"))?,
        _ => return Err(ToolError::invalid_argument("referenced step holds no rows")),
    };
    array
        .iter()
        .map(|row| {
            row.as_object()
                .cloned()
                .ok_or_else(|| ToolError::invalid_argument("rows must be objects"))
        })
        .collect()
}

/// Run a program against the server context. The wall-clock limit is
/// enforced by the caller; errors inside steps surface as INTERNAL with the
/// message truncated to a bound.
pub async fn run_program(
    ctx: &ServerContext,
    program: &Program,
    jail: &FsJail,
) -> ToolResult<Value> {
    if program.steps.is_empty() {
        return Err(ToolError::invalid_argument("program has no steps"));
    }

    let mut env = Env {
        values: HashMap::new(),
        bytes_used: 0,
        soft_limit: ctx.config.sandbox.memory_soft_bytes,
    };
    let mut last_id: Option<String> = None;

    for step in &program.steps {
        match step {
            Step::Data { id, value } => {
                env.store(id, value.clone())?;
                last_id = Some(id.clone());
            }
            Step::Query {
                id,
                sql,
                params,
                cache,
            } => {
                let request = QueryRequest {
                    sql: sql.clone(),
                    params: params.clone(),
                    timeout_ms: None,
                    cache: *cache,
                    row_limit: None,
                    transaction: None,
                    tenant: None,
                    connection: None,
                };
                let value = dbops::run_query_request(ctx, &request).await?;
                env.store(id, value)?;
                last_id = Some(id.clone());
            }
            Step::StreamAggregate {
                id,
                sql,
                params,
                reducer,
                batch_size,
            } => {
                let request = QueryRequest {
                    sql: sql.clone(),
                    params: params.clone(),
                    timeout_ms: None,
                    cache: CacheMode::Off,
                    row_limit: None,
                    transaction: None,
                    tenant: None,
                    connection: None,
                };
                let batch = batch_size.unwrap_or(ctx.config.sandbox.batch_size).max(1);
                let value = run_stream_aggregate(ctx, &request, reducer, batch).await?;
                env.store(id, value)?;
                last_id = Some(id.clone());
            }
            Step::Pipeline { id, input, ops } => {
                let rows = rows_of(env.get(input)?)?;
                let out = pipeline::apply(rows, ops)?;
                env.store(id, Value::Array(out.into_iter().map(Value::Object).collect()))?;
                last_id = Some(id.clone());
            }
            Step::Skill { id, name, input } => {
                let input_value = env.get(input)?.clone();
                // Skills accept row arrays; unwrap query envelopes first.
                let normalized = match &input_value {
                    Value::Object(obj) if obj.contains_key("rows") => {
                        obj.get("rows").cloned().unwrap_or(Value::Null)
                    }
                    other => other.clone(),
                };
                let out = skills::run(name, &normalized)?;
                env.store(id, out)?;
                last_id = Some(id.clone());
            }
            Step::FsRead { id, path } => {
                let content = jail.read(path).await?;
                let value = serde_json::from_str::<Value>(&content)
                    .unwrap_or(Value::String(content));
                env.store(id, value)?;
                last_id = Some(id.clone());
            }
            Step::FsWrite { path, from } => {
                let value = env.get(from)?;
                let content = serde_json::to_string_pretty(value)
                    .map_err(|e| ToolError::internal(e.to_string()))?;
                jail.write(path, &content).await?;
            }
        }
    }

    let result_id = program
        .result
        .clone()
        .or(last_id)
        .ok_or_else(|| ToolError::invalid_argument("program produced no result"))?;
    Ok(env.get(&result_id)?.clone())
}

async fn run_stream_aggregate(
    ctx: &ServerContext,
    request: &QueryRequest,
    reducer: &Reducer,
    batch_size: usize,
) -> ToolResult<Value> {
    #[derive(Default)]
    struct Acc {
        count: u64,
        sum: f64,
        numeric_count: u64,
        min: Option<f64>,
        max: Option<f64>,
        collected: Vec<Value>,
        distinct: std::collections::BTreeSet<String>,
    }

    let kind = reducer.kind;
    let field = reducer.field.clone();

    if !matches!(kind, ReducerKind::Count | ReducerKind::Collect) && field.is_none() {
        return Err(ToolError::invalid_argument(
            "reducer requires a field for sum/avg/min/max/distinct",
        ));
    }

    let (acc, total_rows) = dbops::stream_query_request(
        ctx,
        request,
        batch_size,
        Acc::default(),
        move |mut acc, batch| {
            for row in batch {
                acc.count += 1;
                match kind {
                    ReducerKind::Count => {}
                    ReducerKind::Collect => acc.collected.push(Value::Object(row)),
                    _ => {
                        let field = field.as_deref().expect("checked above");
                        let value = row.get(field);
                        match kind {
                            ReducerKind::Distinct => {
                                if let Some(v) = value {
                                    acc.distinct.insert(v.to_string());
                                }
                            }
                            _ => {
                                if let Some(n) = value.and_then(Value::as_f64) {
                                    acc.numeric_count += 1;
                                    acc.sum += n;
                                    acc.min =
                                        Some(acc.min.map_or(n, |m: f64| m.min(n)));
                                    acc.max =
                                        Some(acc.max.map_or(n, |m: f64| m.max(n)));
                                }
                            }
                        }
                    }
                }
            }
            Ok(acc)
        },
    )
    .await?;

    let value = match kind {
        ReducerKind::Count => json!(acc.count),
        ReducerKind::Sum => json!(acc.sum),
        ReducerKind::Avg => {
            if acc.numeric_count == 0 {
                Value::Null
            } else {
                json!(acc.sum / acc.numeric_count as f64)
            }
        }
        ReducerKind::Min => acc.min.map(|v| json!(v)).unwrap_or(Value::Null),
        ReducerKind::Max => acc.max.map(|v| json!(v)).unwrap_or(Value::Null),
        ReducerKind::Collect => Value::Array(acc.collected),
        ReducerKind::Distinct => json!(acc.distinct.len()),
    };

    Ok(json!({ "value": value, "rows_scanned": total_rows }))
}

/// Clamp an interior error for the response, keeping the stable code.
pub fn bound_error(err: ToolError) -> ToolError {
    const MAX_MESSAGE: usize = 2048;
    if err.message.len() <= MAX_MESSAGE {
        return err;
    }
    let mut truncated = err.message;
    truncated.truncate(MAX_MESSAGE);
    truncated.push_str("… (truncated)");
    ToolError {
        code: err.code,
        message: truncated,
        details: err.details,
        retry_after: err.retry_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::ErrorCode;

    #[test]
    fn test_program_parses() {
        let raw = json!({
            "steps": [
                { "op": "query", "id": "a", "sql": "SELECT * FROM orders", "cache": "read" },
                { "op": "pipeline", "id": "b", "input": "a", "ops": [
                    { "op": "filter", "condition": { "kind": "cmp", "field": "status", "cmp": "eq", "value": "open" } },
                    { "op": "limit", "count": 10 }
                ]},
                { "op": "skill", "id": "c", "name": "analytics.describe", "input": "b" },
                { "op": "fs_write", "path": "out.json", "from": "c" }
            ],
            "result": "c"
        });
        let program: Program = serde_json::from_value(raw).unwrap();
        assert_eq!(program.steps.len(), 4);
        assert_eq!(program.result.as_deref(), Some("c"));
    }

    #[test]
    fn test_stream_aggregate_parses() {
        let raw = json!({
            "steps": [
                { "op": "stream_aggregate", "id": "total", "sql": "SELECT amount FROM orders",
                  "reducer": { "kind": "sum", "field": "amount" }, "batch_size": 500 }
            ]
        });
        let program: Program = serde_json::from_value(raw).unwrap();
        match &program.steps[0] {
            Step::StreamAggregate { reducer, batch_size, .. } => {
                assert_eq!(reducer.kind, ReducerKind::Sum);
                assert_eq!(*batch_size, Some(500));
            }
            _ => panic!("wrong step"),
        }
    }

    #[test]
    fn test_size_estimation_grows_with_data() {
        let small = estimate_size(&json!({"a": 1}));
        let large = estimate_size(&json!({"a": "x".repeat(10_000)}));
        assert!(large > small + 9_000);
    }

    #[test]
    fn test_bound_error_truncates() {
        let err = ToolError::internal("x".repeat(10_000));
        let bounded = bound_error(err);
        assert!(bounded.message.len() < 3000);
        assert_eq!(bounded.code, ErrorCode::Internal);
    }

    #[test]
    fn test_rows_of_accepts_envelope_and_array() {
        let envelope = json!({ "rows": [{"a": 1}], "row_count": 1 });
        assert_eq!(rows_of(&envelope).unwrap().len(), 1);

        let array = json!([{"a": 1}, {"a": 2}]);
        assert_eq!(rows_of(&array).unwrap().len(), 2);

        assert!(rows_of(&json!(42)).is_err());
    }
}
