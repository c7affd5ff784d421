//! SQL statement inspection: read-only validation, cacheability, and
//! named-parameter rewriting.
//!
//! All checks run against a sanitized copy of the statement in which string
//! literals, quoted identifiers, dollar-quoted bodies, and comments are
//! blanked out, so keywords inside literals never trigger false positives.

use crate::error::{DbError, Result};
use serde_json::Value;

const ALLOWED_PREFIXES: &[&str] = &["SELECT", "WITH", "EXPLAIN", "VALUES"];
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "CALL", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "COPY", "GRANT", "REVOKE", "VACUUM", "REINDEX",
];

/// Validate that a statement is read-only (single statement, starts with an
/// allowed prefix, and contains no mutating keyword outside literals).
pub fn validate_read_only(sql: &str) -> Result<()> {
    let sanitized = sanitize_sql(sql);
    if sanitized.trim().is_empty() {
        return Err(DbError::invalid("statement is empty"));
    }

    validate_single_statement(&sanitized)?;

    let first = first_keyword(&sanitized)
        .ok_or_else(|| DbError::invalid("statement must start with SELECT, WITH, or EXPLAIN"))?;
    if !ALLOWED_PREFIXES.contains(&first.as_str()) {
        return Err(DbError::invalid(
            "statement must start with SELECT, WITH, or EXPLAIN",
        ));
    }

    for token in tokens_upper(&sanitized) {
        if FORBIDDEN_KEYWORDS.contains(&token.as_str()) {
            return Err(DbError::invalid(format!(
                "statement contains mutating keyword: {token}"
            )));
        }
    }

    Ok(())
}

/// Whether a statement qualifies for result caching: read-only and starting
/// with SELECT or WITH (EXPLAIN output is never cached).
pub fn is_cacheable(sql: &str) -> bool {
    if validate_read_only(sql).is_err() {
        return false;
    }
    matches!(
        first_keyword(&sanitize_sql(sql)).as_deref(),
        Some("SELECT") | Some("WITH")
    )
}

/// Wrap a read-only statement with a row limit. EXPLAIN output is returned
/// unchanged.
pub fn apply_row_limit(sql: &str, limit: usize) -> String {
    let stripped = strip_trailing_semicolon(sql);
    match first_keyword(&sanitize_sql(stripped)).as_deref() {
        Some("SELECT") | Some("WITH") | Some("VALUES") => {
            format!("SELECT * FROM ({}) AS _q LIMIT {}", stripped.trim(), limit)
        }
        _ => stripped.trim().to_string(),
    }
}

/// Rewrite `:name` placeholders to positional `$n` binds.
///
/// Accepts either positional parameters (a JSON array, passed through) or
/// named parameters (a JSON object matched against `:name` tokens in source
/// order, each name bound once). Interpolation never happens here; the
/// driver receives placeholders and a value list.
pub fn bind_parameters(sql: &str, params: &Value) -> Result<(String, Vec<Value>)> {
    match params {
        Value::Null => Ok((sql.to_string(), Vec::new())),
        Value::Array(values) => Ok((sql.to_string(), values.clone())),
        Value::Object(named) => rewrite_named(sql, named),
        _ => Err(DbError::invalid(
            "parameters must be an array (positional) or object (named)",
        )),
    }
}

fn rewrite_named(
    sql: &str,
    named: &serde_json::Map<String, Value>,
) -> Result<(String, Vec<Value>)> {
    // The sanitizer is char-preserving, so positions line up between the
    // source and the sanitized copy.
    let san: Vec<char> = sanitize_sql(sql).chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values: Vec<Value> = Vec::new();
    let mut order: Vec<String> = Vec::new();

    let mut i = 0;
    let src: Vec<char> = sql.chars().collect();
    while i < src.len() {
        let ch = src[i];
        // Only rewrite where the sanitized copy still shows a ':' (i.e. the
        // token is outside any literal), and skip `::` casts.
        let in_code = san.get(i) == Some(&':');
        let is_cast = ch == ':' && src.get(i + 1) == Some(&':');
        if ch == ':' && in_code && !is_cast && i + 1 < src.len() && is_ident_start(src[i + 1]) {
            let mut j = i + 1;
            let mut name = String::new();
            while j < src.len() && is_ident_char(src[j]) {
                name.push(src[j]);
                j += 1;
            }
            let value = named.get(&name).ok_or_else(|| {
                DbError::invalid(format!("missing named parameter: {name}"))
            })?;
            let position = match order.iter().position(|n| n == &name) {
                Some(pos) => pos + 1,
                None => {
                    order.push(name.clone());
                    values.push(value.clone());
                    values.len()
                }
            };
            out.push('$');
            out.push_str(&position.to_string());
            i = j;
        } else if is_cast {
            out.push(':');
            out.push(':');
            i += 2;
        } else {
            out.push(ch);
            i += 1;
        }
    }

    Ok((out, values))
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.strip_suffix(';') {
        Some(stripped) => stripped.trim_end(),
        None => trimmed,
    }
}

fn validate_single_statement(sanitized: &str) -> Result<()> {
    let mut semicolons = sanitized.match_indices(';').map(|(idx, _)| idx);
    let first = semicolons.next();
    if semicolons.next().is_some() {
        return Err(DbError::invalid("multiple statements are not allowed"));
    }
    if let Some(idx) = first {
        if sanitized[idx + 1..].chars().any(|c| !c.is_whitespace()) {
            return Err(DbError::invalid("multiple statements are not allowed"));
        }
    }
    Ok(())
}

fn first_keyword(sanitized: &str) -> Option<String> {
    let mut current = String::new();
    for ch in sanitized.chars() {
        if ch.is_ascii_alphabetic() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    if current.is_empty() {
        None
    } else {
        Some(current.to_ascii_uppercase())
    }
}

fn tokens_upper(sanitized: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in sanitized.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(current.to_ascii_uppercase());
            current.clear();
        }
    }
    if !current.is_empty() {
        tokens.push(current.to_ascii_uppercase());
    }
    tokens
}

#[derive(Clone, Copy, PartialEq)]
enum ScanState {
    Code,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
    DollarQuote,
}

/// Blank out string literals, quoted identifiers, dollar-quoted bodies, and
/// comments, preserving length and positions of everything else.
pub fn sanitize_sql(sql: &str) -> String {
    let src: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = ScanState::Code;
    let mut dollar_tag = String::new();
    let mut i = 0;

    while i < src.len() {
        let ch = src[i];
        match state {
            ScanState::Code => match ch {
                '\'' => {
                    state = ScanState::SingleQuote;
                    out.push(' ');
                    i += 1;
                }
                '"' => {
                    state = ScanState::DoubleQuote;
                    out.push(' ');
                    i += 1;
                }
                '-' if src.get(i + 1) == Some(&'-') => {
                    state = ScanState::LineComment;
                    out.push_str("  ");
                    i += 2;
                }
                '/' if src.get(i + 1) == Some(&'*') => {
                    state = ScanState::BlockComment;
                    out.push_str("  ");
                    i += 2;
                }
                '$' => {
                    if let Some(tag) = read_dollar_tag(&src, i) {
                        for _ in 0..tag.len() {
                            out.push(' ');
                        }
                        i += tag.len();
                        dollar_tag = tag;
                        state = ScanState::DollarQuote;
                    } else {
                        out.push('$');
                        i += 1;
                    }
                }
                _ => {
                    out.push(ch);
                    i += 1;
                }
            },
            ScanState::SingleQuote => {
                if ch == '\'' {
                    if src.get(i + 1) == Some(&'\'') {
                        out.push_str("  ");
                        i += 2;
                    } else {
                        state = ScanState::Code;
                        out.push(' ');
                        i += 1;
                    }
                } else {
                    out.push(' ');
                    i += 1;
                }
            }
            ScanState::DoubleQuote => {
                if ch == '"' {
                    state = ScanState::Code;
                }
                out.push(' ');
                i += 1;
            }
            ScanState::LineComment => {
                if ch == '\n' {
                    state = ScanState::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
                i += 1;
            }
            ScanState::BlockComment => {
                if ch == '*' && src.get(i + 1) == Some(&'/') {
                    state = ScanState::Code;
                    out.push_str("  ");
                    i += 2;
                } else {
                    out.push(' ');
                    i += 1;
                }
            }
            ScanState::DollarQuote => {
                let tag_chars: Vec<char> = dollar_tag.chars().collect();
                if ch == '$' && src[i..].starts_with(tag_chars.as_slice()) {
                    for _ in 0..dollar_tag.len() {
                        out.push(' ');
                    }
                    i += dollar_tag.len();
                    state = ScanState::Code;
                } else {
                    out.push(' ');
                    i += 1;
                }
            }
        }
    }

    out
}

/// Read a `$tag$` opener at position `i`, returning the full tag including
/// both dollar signs.
fn read_dollar_tag(src: &[char], i: usize) -> Option<String> {
    debug_assert_eq!(src[i], '$');
    let mut tag = String::from("$");
    let mut j = i + 1;
    while j < src.len() {
        let ch = src[j];
        if ch == '$' {
            tag.push('$');
            return Some(tag);
        }
        if !is_ident_char(ch) {
            return None;
        }
        tag.push(ch);
        j += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_read_only_basic() {
        assert!(validate_read_only("SELECT * FROM events").is_ok());
        assert!(validate_read_only("WITH cte AS (SELECT 1) SELECT * FROM cte").is_ok());
        assert!(validate_read_only("EXPLAIN SELECT * FROM events").is_ok());
        assert!(validate_read_only("INSERT INTO events VALUES (1)").is_err());
        assert!(validate_read_only("DELETE FROM events").is_err());
        assert!(validate_read_only("DROP TABLE events").is_err());
        assert!(validate_read_only("UPDATE events SET id = 1").is_err());
        assert!(validate_read_only("CALL refresh()").is_err());
    }

    #[test]
    fn test_validate_read_only_comments_and_literals() {
        assert!(validate_read_only("SELECT 1 -- INSERT INTO events").is_ok());
        assert!(validate_read_only("SELECT 1 /* DELETE */ FROM events").is_ok());
        assert!(validate_read_only("SELECT 'DROP TABLE x' FROM events").is_ok());
        assert!(validate_read_only("SELECT $$UPDATE t SET x$$ FROM events").is_ok());
    }

    #[test]
    fn test_validate_read_only_multi_statement() {
        assert!(validate_read_only("SELECT 1; DROP TABLE events").is_err());
        assert!(validate_read_only("SELECT 1;\nDELETE FROM events").is_err());
        assert!(validate_read_only("SELECT 1; ").is_ok());
    }

    #[test]
    fn test_nested_forbidden_keyword() {
        assert!(validate_read_only("SELECT * FROM (DELETE FROM events RETURNING *)").is_err());
    }

    #[test]
    fn test_cacheable() {
        assert!(is_cacheable("SELECT now()"));
        assert!(is_cacheable("WITH c AS (SELECT 1) SELECT * FROM c"));
        assert!(!is_cacheable("EXPLAIN SELECT 1"));
        assert!(!is_cacheable("UPDATE t SET x = 1"));
    }

    #[test]
    fn test_apply_row_limit() {
        assert_eq!(
            apply_row_limit("SELECT * FROM events", 100),
            "SELECT * FROM (SELECT * FROM events) AS _q LIMIT 100"
        );
        assert_eq!(
            apply_row_limit("SELECT * FROM events;", 25),
            "SELECT * FROM (SELECT * FROM events) AS _q LIMIT 25"
        );
        assert_eq!(
            apply_row_limit("EXPLAIN SELECT * FROM events", 10),
            "EXPLAIN SELECT * FROM events"
        );
    }

    #[test]
    fn test_positional_params_pass_through() {
        let (sql, values) =
            bind_parameters("SELECT $1, $2", &json!([1, "two"])).unwrap();
        assert_eq!(sql, "SELECT $1, $2");
        assert_eq!(values, vec![json!(1), json!("two")]);
    }

    #[test]
    fn test_named_params_rewritten_in_order() {
        let (sql, values) = bind_parameters(
            "SELECT * FROM t WHERE a = :min AND b = :max AND c = :min",
            &json!({"min": 1, "max": 9}),
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = $1 AND b = $2 AND c = $1");
        assert_eq!(values, vec![json!(1), json!(9)]);
    }

    #[test]
    fn test_named_params_skip_casts_and_literals() {
        let (sql, values) = bind_parameters(
            "SELECT ':notaparam', x::int FROM t WHERE y = :y",
            &json!({"y": 5}),
        )
        .unwrap();
        assert_eq!(sql, "SELECT ':notaparam', x::int FROM t WHERE y = $1");
        assert_eq!(values, vec![json!(5)]);
    }

    #[test]
    fn test_missing_named_param() {
        assert!(bind_parameters("SELECT :a", &json!({"b": 1})).is_err());
    }

    #[test]
    fn test_dollar_quote_sanitized() {
        let sanitized = sanitize_sql("SELECT $body$DROP TABLE x$body$ FROM t");
        assert!(!sanitized.contains("DROP"));
        assert!(sanitized.contains("FROM t"));
    }
}
