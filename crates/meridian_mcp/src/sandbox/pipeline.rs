//! Chainable row pipeline: filter, map, group_by, sort, limit.
//!
//! Operates on in-memory arrays of row objects. Filter predicates reuse the
//! declarative condition language shared with the policy engine.

use meridian_policy::Condition;
use meridian_protocol::{ToolError, ToolResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One pipeline stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PipelineOp {
    Filter {
        condition: Condition,
    },
    /// Project and rename columns.
    Map {
        fields: Vec<FieldSpec>,
    },
    GroupBy {
        keys: Vec<String>,
        #[serde(default)]
        aggregates: Vec<AggregateSpec>,
    },
    Sort {
        by: String,
        #[serde(default)]
        descending: bool,
    },
    Limit {
        count: usize,
    },
}

/// Output field: `name` taken from `from` (defaults to `name`).
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregateSpec {
    pub name: String,
    pub kind: AggKind,
    #[serde(default)]
    pub field: Option<String>,
}

/// Run every stage in order.
pub fn apply(
    mut rows: Vec<Map<String, Value>>,
    ops: &[PipelineOp],
) -> ToolResult<Vec<Map<String, Value>>> {
    for op in ops {
        rows = match op {
            PipelineOp::Filter { condition } => rows
                .into_iter()
                .filter(|row| condition.evaluate(row))
                .collect(),
            PipelineOp::Map { fields } => rows
                .into_iter()
                .map(|row| {
                    let mut out = Map::new();
                    for spec in fields {
                        let source = spec.from.as_deref().unwrap_or(&spec.name);
                        out.insert(
                            spec.name.clone(),
                            row.get(source).cloned().unwrap_or(Value::Null),
                        );
                    }
                    out
                })
                .collect(),
            PipelineOp::GroupBy { keys, aggregates } => group_by(rows, keys, aggregates)?,
            PipelineOp::Sort { by, descending } => {
                rows.sort_by(|a, b| {
                    let ord = compare_values(a.get(by), b.get(by));
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                rows
            }
            PipelineOp::Limit { count } => {
                rows.truncate(*count);
                rows
            }
        };
    }
    Ok(rows)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn group_by(
    rows: Vec<Map<String, Value>>,
    keys: &[String],
    aggregates: &[AggregateSpec],
) -> ToolResult<Vec<Map<String, Value>>> {
    if keys.is_empty() {
        return Err(ToolError::invalid_argument("group_by requires keys"));
    }

    // BTreeMap keeps group output deterministic.
    let mut groups: BTreeMap<String, (Map<String, Value>, Vec<Map<String, Value>>)> =
        BTreeMap::new();

    for row in rows {
        let group_key = keys
            .iter()
            .map(|k| row.get(k).map(|v| v.to_string()).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1}");
        let entry = groups.entry(group_key).or_insert_with(|| {
            let mut key_fields = Map::new();
            for k in keys {
                key_fields.insert(k.clone(), row.get(k).cloned().unwrap_or(Value::Null));
            }
            (key_fields, Vec::new())
        });
        entry.1.push(row);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, (mut key_fields, members)) in groups {
        for spec in aggregates {
            let value = aggregate(&members, spec)?;
            key_fields.insert(spec.name.clone(), value);
        }
        if aggregates.is_empty() {
            key_fields.insert("count".into(), Value::from(members.len() as u64));
        }
        out.push(key_fields);
    }
    Ok(out)
}

fn aggregate(members: &[Map<String, Value>], spec: &AggregateSpec) -> ToolResult<Value> {
    if matches!(spec.kind, AggKind::Count) {
        return Ok(Value::from(members.len() as u64));
    }

    let field = spec.field.as_deref().ok_or_else(|| {
        ToolError::invalid_argument(format!("aggregate {} requires a field", spec.name))
    })?;
    let numbers: Vec<f64> = members
        .iter()
        .filter_map(|row| row.get(field).and_then(Value::as_f64))
        .collect();

    if numbers.is_empty() {
        return Ok(Value::Null);
    }

    Ok(match spec.kind {
        AggKind::Count => unreachable!(),
        AggKind::Sum => Value::from(numbers.iter().sum::<f64>()),
        AggKind::Avg => Value::from(numbers.iter().sum::<f64>() / numbers.len() as f64),
        AggKind::Min => Value::from(numbers.iter().cloned().fold(f64::INFINITY, f64::min)),
        AggKind::Max => Value::from(numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Map<String, Value>> {
        [
            json!({ "region": "east", "amount": 10, "status": "open" }),
            json!({ "region": "west", "amount": 30, "status": "open" }),
            json!({ "region": "east", "amount": 20, "status": "closed" }),
            json!({ "region": "west", "amount": 40, "status": "open" }),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
    }

    fn ops(raw: Value) -> Vec<PipelineOp> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_filter_then_limit() {
        let ops = ops(json!([
            { "op": "filter", "condition": { "kind": "cmp", "field": "status", "cmp": "eq", "value": "open" } },
            { "op": "limit", "count": 2 }
        ]));
        let out = apply(rows(), &ops).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r["status"] == "open"));
    }

    #[test]
    fn test_map_projection_and_rename() {
        let ops = ops(json!([
            { "op": "map", "fields": [
                { "name": "region" },
                { "name": "total", "from": "amount" }
            ]}
        ]));
        let out = apply(rows(), &ops).unwrap();
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[0]["total"], 10);
        assert!(out[0].get("status").is_none());
    }

    #[test]
    fn test_group_by_with_aggregates() {
        let ops = ops(json!([
            { "op": "group_by", "keys": ["region"], "aggregates": [
                { "name": "total", "kind": "sum", "field": "amount" },
                { "name": "orders", "kind": "count" },
                { "name": "biggest", "kind": "max", "field": "amount" }
            ]},
            { "op": "sort", "by": "region" }
        ]));
        let out = apply(rows(), &ops).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["region"], "east");
        assert_eq!(out[0]["total"], 30.0);
        assert_eq!(out[0]["orders"], 2);
        assert_eq!(out[1]["biggest"], 40.0);
    }

    #[test]
    fn test_sort_descending() {
        let ops = ops(json!([
            { "op": "sort", "by": "amount", "descending": true }
        ]));
        let out = apply(rows(), &ops).unwrap();
        assert_eq!(out[0]["amount"], 40);
        assert_eq!(out[3]["amount"], 10);
    }

    #[test]
    fn test_group_by_without_keys_rejected() {
        let ops = ops(json!([{ "op": "group_by", "keys": [] }]));
        assert!(apply(rows(), &ops).is_err());
    }
}
