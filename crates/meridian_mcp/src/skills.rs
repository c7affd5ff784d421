//! Skills library: deterministic named helpers over row sets.
//!
//! Callable from the direct `skill_run` tool and importable as `skill`
//! steps in code-API programs. Inputs are arrays of row objects; outputs
//! are plain JSON. No skill touches the network or the clock.

use meridian_protocol::{ToolError, ToolResult};
use serde_json::{json, Map, Value};

/// Catalog entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SkillInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// All registered skills, fixed at startup.
pub fn catalog() -> Vec<SkillInfo> {
    vec![
        SkillInfo {
            name: "analytics.describe",
            description: "Per-column count, nulls, min/max/avg for numeric columns",
        },
        SkillInfo {
            name: "quality.null_report",
            description: "Null counts and ratios per column",
        },
        SkillInfo {
            name: "quality.duplicates",
            description: "Duplicate row groups by key columns",
        },
        SkillInfo {
            name: "report.markdown_table",
            description: "Render rows as a markdown table",
        },
    ]
}

/// Run a skill by name.
pub fn run(name: &str, input: &Value) -> ToolResult<Value> {
    let rows = as_rows(input)?;
    match name {
        "analytics.describe" => Ok(describe(&rows)),
        "quality.null_report" => Ok(null_report(&rows)),
        "quality.duplicates" => {
            // Keys ride alongside the rows: {"rows": [...], "keys": [...]}.
            let keys = input
                .get("keys")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Ok(duplicates(&rows, &keys))
        }
        "report.markdown_table" => Ok(markdown_table(&rows)),
        _ => Err(ToolError::not_found(format!("no such skill: {name}"))),
    }
}

fn as_rows(input: &Value) -> ToolResult<Vec<Map<String, Value>>> {
    let array = match input {
        Value::Array(rows) => rows,
        Value::Object(obj) => obj
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::invalid_argument("input must be rows or {rows: [...]}"))?,
        _ => return Err(ToolError::invalid_argument("input must be an array of rows")),
    };

    array
        .iter()
        .map(|row| {
            row.as_object().cloned().ok_or_else(|| {
                ToolError::invalid_argument("each row must be an object")
            })
        })
        .collect()
}

fn column_names(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut names = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    names
}

fn describe(rows: &[Map<String, Value>]) -> Value {
    let mut columns = Map::new();
    for name in column_names(rows) {
        let mut count = 0u64;
        let mut nulls = 0u64;
        let mut numeric: Vec<f64> = Vec::new();

        for row in rows {
            match row.get(&name) {
                None | Some(Value::Null) => nulls += 1,
                Some(value) => {
                    count += 1;
                    if let Some(n) = value.as_f64() {
                        numeric.push(n);
                    }
                }
            }
        }

        let mut summary = Map::new();
        summary.insert("count".into(), json!(count));
        summary.insert("nulls".into(), json!(nulls));
        if !numeric.is_empty() {
            let sum: f64 = numeric.iter().sum();
            let min = numeric.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            summary.insert("min".into(), json!(min));
            summary.insert("max".into(), json!(max));
            summary.insert("avg".into(), json!(sum / numeric.len() as f64));
        }
        columns.insert(name, Value::Object(summary));
    }

    json!({ "row_count": rows.len(), "columns": columns })
}

fn null_report(rows: &[Map<String, Value>]) -> Value {
    let total = rows.len() as f64;
    let mut report = Map::new();
    for name in column_names(rows) {
        let nulls = rows
            .iter()
            .filter(|row| matches!(row.get(&name), None | Some(Value::Null)))
            .count();
        report.insert(
            name,
            json!({
                "nulls": nulls,
                "ratio": if total > 0.0 { nulls as f64 / total } else { 0.0 },
            }),
        );
    }
    json!({ "row_count": rows.len(), "columns": report })
}

fn duplicates(rows: &[Map<String, Value>], keys: &[String]) -> Value {
    use std::collections::HashMap;

    let mut groups: HashMap<String, u64> = HashMap::new();
    for row in rows {
        let key = if keys.is_empty() {
            serde_json::to_string(row).unwrap_or_default()
        } else {
            keys.iter()
                .map(|k| row.get(k).map(|v| v.to_string()).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\u{1}")
        };
        *groups.entry(key).or_insert(0) += 1;
    }

    let mut duplicate_groups: Vec<u64> = groups.values().copied().filter(|&c| c > 1).collect();
    duplicate_groups.sort_unstable_by(|a, b| b.cmp(a));
    let duplicate_rows: u64 = duplicate_groups.iter().map(|c| c - 1).sum();

    json!({
        "row_count": rows.len(),
        "duplicate_groups": duplicate_groups.len(),
        "duplicate_rows": duplicate_rows,
        "largest_group": duplicate_groups.first().copied().unwrap_or(0),
    })
}

fn markdown_table(rows: &[Map<String, Value>]) -> Value {
    let names = column_names(rows);
    if names.is_empty() {
        return json!({ "markdown": "(no rows)" });
    }

    let mut out = String::new();
    out.push_str("| ");
    out.push_str(&names.join(" | "));
    out.push_str(" |\n|");
    for _ in &names {
        out.push_str(" --- |");
    }
    out.push('\n');

    for row in rows {
        out.push_str("| ");
        let cells: Vec<String> = names
            .iter()
            .map(|name| match row.get(name) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        out.push_str(&cells.join(" | "));
        out.push_str(" |\n");
    }

    json!({ "markdown": out, "row_count": rows.len() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Value {
        json!([
            { "id": 1, "name": "a", "amount": 10.0 },
            { "id": 2, "name": "b", "amount": 30.0 },
            { "id": 3, "name": null, "amount": null }
        ])
    }

    #[test]
    fn test_describe() {
        let out = run("analytics.describe", &rows()).unwrap();
        assert_eq!(out["row_count"], 3);
        assert_eq!(out["columns"]["amount"]["count"], 2);
        assert_eq!(out["columns"]["amount"]["min"], 10.0);
        assert_eq!(out["columns"]["amount"]["max"], 30.0);
        assert_eq!(out["columns"]["amount"]["avg"], 20.0);
        assert_eq!(out["columns"]["name"]["nulls"], 1);
    }

    #[test]
    fn test_null_report() {
        let out = run("quality.null_report", &rows()).unwrap();
        assert_eq!(out["columns"]["name"]["nulls"], 1);
        assert_eq!(out["columns"]["id"]["nulls"], 0);
    }

    #[test]
    fn test_duplicates_by_key() {
        let input = json!({
            "rows": [
                { "sku": "x", "qty": 1 },
                { "sku": "x", "qty": 2 },
                { "sku": "y", "qty": 3 }
            ],
            "keys": ["sku"]
        });
        let out = run("quality.duplicates", &input).unwrap();
        assert_eq!(out["duplicate_groups"], 1);
        assert_eq!(out["duplicate_rows"], 1);
        assert_eq!(out["largest_group"], 2);
    }

    #[test]
    fn test_markdown_table() {
        let out = run("report.markdown_table", &rows()).unwrap();
        let md = out["markdown"].as_str().unwrap();
        assert!(md.starts_with("| id | name | amount |"));
        assert!(md.contains("| 1 | a | 10.0 |") || md.contains("| 1 | a | 10 |"));
    }

    #[test]
    fn test_unknown_skill() {
        assert!(run("nope.nothing", &rows()).is_err());
    }

    #[test]
    fn test_deterministic() {
        let a = run("analytics.describe", &rows()).unwrap();
        let b = run("analytics.describe", &rows()).unwrap();
        assert_eq!(a, b);
    }
}
