//! Declarative rule conditions.
//!
//! Rules are data, not code: comparisons against named fields combined with
//! all/any/not. A condition that references a missing field evaluates to
//! false rather than erroring, so partial commands never match by accident.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Comparison operators usable in rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Field value is one of the listed values.
    In,
    /// String field contains the substring, or array field contains the value.
    Contains,
}

/// A composable rule condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Condition {
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    Cmp {
        field: String,
        cmp: Comparator,
        value: Value,
    },
}

impl Condition {
    /// Evaluate against a flat field map.
    pub fn evaluate(&self, fields: &Map<String, Value>) -> bool {
        match self {
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(fields)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(fields)),
            Self::Not { condition } => !condition.evaluate(fields),
            Self::Cmp { field, cmp, value } => {
                let Some(actual) = fields.get(field) else {
                    return false;
                };
                compare(actual, *cmp, value)
            }
        }
    }
}

fn compare(actual: &Value, cmp: Comparator, expected: &Value) -> bool {
    match cmp {
        Comparator::Eq => actual == expected,
        Comparator::Ne => actual != expected,
        Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
            let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) else {
                return false;
            };
            match cmp {
                Comparator::Gt => a > b,
                Comparator::Gte => a >= b,
                Comparator::Lt => a < b,
                Comparator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        Comparator::In => match expected {
            Value::Array(items) => items.contains(actual),
            _ => false,
        },
        Comparator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_comparisons() {
        let fields = fields(json!({"temp": 72, "mode": "heat"}));

        let gt = Condition::Cmp {
            field: "temp".into(),
            cmp: Comparator::Gt,
            value: json!(70),
        };
        assert!(gt.evaluate(&fields));

        let eq = Condition::Cmp {
            field: "mode".into(),
            cmp: Comparator::Eq,
            value: json!("heat"),
        };
        assert!(eq.evaluate(&fields));

        let lt = Condition::Cmp {
            field: "temp".into(),
            cmp: Comparator::Lt,
            value: json!(70),
        };
        assert!(!lt.evaluate(&fields));
    }

    #[test]
    fn test_missing_field_is_false() {
        let fields = fields(json!({"a": 1}));
        let cond = Condition::Cmp {
            field: "missing".into(),
            cmp: Comparator::Eq,
            value: json!(1),
        };
        assert!(!cond.evaluate(&fields));
    }

    #[test]
    fn test_logical_combinators() {
        let fields = fields(json!({"temp": 80, "area": "bedroom"}));

        let cond = Condition::All {
            conditions: vec![
                Condition::Cmp {
                    field: "temp".into(),
                    cmp: Comparator::Gte,
                    value: json!(75),
                },
                Condition::Not {
                    condition: Box::new(Condition::Cmp {
                        field: "area".into(),
                        cmp: Comparator::Eq,
                        value: json!("garage"),
                    }),
                },
            ],
        };
        assert!(cond.evaluate(&fields));
    }

    #[test]
    fn test_in_and_contains() {
        let fields = fields(json!({"tag": "critical", "labels": ["a", "b"]}));

        let is_in = Condition::Cmp {
            field: "tag".into(),
            cmp: Comparator::In,
            value: json!(["critical", "urgent"]),
        };
        assert!(is_in.evaluate(&fields));

        let contains = Condition::Cmp {
            field: "labels".into(),
            cmp: Comparator::Contains,
            value: json!("b"),
        };
        assert!(contains.evaluate(&fields));
    }

    #[test]
    fn test_round_trips_through_json() {
        let cond = Condition::Any {
            conditions: vec![Condition::Cmp {
                field: "x".into(),
                cmp: Comparator::Lte,
                value: json!(5),
            }],
        };
        let text = serde_json::to_string(&cond).unwrap();
        let parsed: Condition = serde_json::from_str(&text).unwrap();
        assert!(parsed.evaluate(&fields(json!({"x": 3}))));
    }
}
