//! Shared query-request execution.
//!
//! Both the direct `db_query` tool and the code-API evaluator run requests
//! through this path, so caching (identical fingerprints), read-only
//! enforcement, row limits, and transaction handles behave the same in both
//! modes.

use std::sync::Arc;
use std::time::Duration;

use meridian_cache::fingerprint;
use meridian_db::{self as db, ManagedPool, QueryOptions};
use meridian_protocol::{retry_with_backoff, RetryPolicy, ToolError, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::context::ServerContext;
use crate::metrics::Metrics;

/// Cache namespace shared by direct queries and sandbox programs.
pub const QUERY_CACHE_NAMESPACE: &str = "query";

/// Cache directive on a query request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CacheMode {
    #[default]
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "read")]
    Read,
    /// Refresh: execute and overwrite whatever is cached.
    #[serde(rename = "read-write")]
    ReadWrite,
}

/// A normalized query request.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache: CacheMode,
    #[serde(default)]
    pub row_limit: Option<usize>,
    /// Open transaction handle; statements inside it are strictly ordered.
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub connection: Option<String>,
}

/// Execute a read-only query request, honoring cache directives.
pub async fn run_query_request(ctx: &ServerContext, request: &QueryRequest) -> ToolResult<Value> {
    db::validate_read_only(&request.sql).map_err(ToolError::from)?;
    let (sql, params) = db::bind_parameters(&request.sql, &request.params)?;

    Metrics::inc(&ctx.metrics.queries);

    // Inside a transaction: no caching, strict ordering through the handle.
    if let Some(handle) = &request.transaction {
        let id = parse_tx_handle(handle)?;
        let row_limit = effective_row_limit(ctx, request.row_limit);
        let output = ctx
            .transactions
            .query_in(id, &sql, &params, row_limit)
            .await?;
        return Ok(output.to_value());
    }

    let pool = resolve_pool(ctx, request)?;
    let opts = query_options(ctx, request);

    let cacheable = request.cache != CacheMode::Off && db::is_cacheable(&request.sql);
    if !cacheable {
        let output = gated_read(&pool, &sql, &params, &opts).await?;
        return Ok(output.to_value());
    }

    let params_value = Value::Array(params.clone());
    let key = fingerprint(QUERY_CACHE_NAMESPACE, &sql, &params_value, &pool.id);

    if request.cache == CacheMode::ReadWrite {
        let output = gated_read(&pool, &sql, &params, &opts).await?;
        let value = output.to_value();
        ctx.cache.set(&key, value.clone(), None).await;
        return Ok(value);
    }

    ctx.cache
        .get_or_set(&key, None, || async {
            let output = gated_read(&pool, &sql, &params, &opts).await?;
            Ok::<_, ToolError>(output.to_value())
        })
        .await
}

/// Read path: breaker-gated, with one retry on transient failures.
/// Reads are idempotent, so the retry is safe; mutations never retry.
async fn gated_read(
    pool: &Arc<ManagedPool>,
    sql: &str,
    params: &[Value],
    opts: &QueryOptions,
) -> ToolResult<db::QueryOutput> {
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(500),
        ..RetryPolicy::default()
    };

    retry_with_backoff(
        &policy,
        "query",
        |err: &db::DbError| err.is_transient(),
        || pool.gated(db::run_query(pool.pool(), sql, params, opts)),
    )
    .await
    .map_err(ToolError::from)
}

/// Execute a mutating statement (already authorized by the caller).
pub async fn run_execute_request(ctx: &ServerContext, request: &QueryRequest) -> ToolResult<u64> {
    let (sql, params) = db::bind_parameters(&request.sql, &request.params)?;
    Metrics::inc(&ctx.metrics.statements_executed);

    if let Some(handle) = &request.transaction {
        let id = parse_tx_handle(handle)?;
        return Ok(ctx.transactions.execute_in(id, &sql, &params).await?);
    }

    let pool = resolve_pool(ctx, request)?;
    let opts = query_options(ctx, request);
    let affected = pool
        .gated(db::run_execute(pool.pool(), &sql, &params, &opts))
        .await?;
    Ok(affected)
}

/// Stream a read-only query in batches through a fold.
pub async fn stream_query_request<T, F>(
    ctx: &ServerContext,
    request: &QueryRequest,
    batch_size: usize,
    init: T,
    step: F,
) -> ToolResult<(T, u64)>
where
    F: FnMut(T, Vec<serde_json::Map<String, Value>>) -> Result<T, meridian_db::DbError>,
{
    db::validate_read_only(&request.sql).map_err(ToolError::from)?;
    let (sql, params) = db::bind_parameters(&request.sql, &request.params)?;
    let pool = resolve_pool(ctx, request)?;

    Metrics::inc(&ctx.metrics.queries);
    db::stream_fold(pool.pool(), &sql, &params, batch_size, init, step)
        .await
        .map_err(ToolError::from)
}

pub fn parse_tx_handle(handle: &str) -> ToolResult<Uuid> {
    Uuid::parse_str(handle)
        .map_err(|_| ToolError::invalid_argument(format!("bad transaction handle: {handle}")))
}

fn resolve_pool(
    ctx: &ServerContext,
    request: &QueryRequest,
) -> ToolResult<std::sync::Arc<meridian_db::ManagedPool>> {
    match &request.connection {
        Some(id) => ctx.connections.get(id).map_err(ToolError::from),
        None => ctx.pool_for(request.tenant.as_deref()),
    }
}

fn effective_row_limit(ctx: &ServerContext, requested: Option<usize>) -> usize {
    requested
        .unwrap_or(ctx.config.max_rows)
        .min(ctx.config.max_rows)
}

fn query_options(ctx: &ServerContext, request: &QueryRequest) -> QueryOptions {
    QueryOptions {
        timeout: Some(Duration::from_millis(request.timeout_ms.unwrap_or(30_000))),
        row_limit: effective_row_limit(ctx, request.row_limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_mode_parsing() {
        let request: QueryRequest =
            serde_json::from_value(json!({ "sql": "SELECT 1", "cache": "read" })).unwrap();
        assert_eq!(request.cache, CacheMode::Read);

        let request: QueryRequest =
            serde_json::from_value(json!({ "sql": "SELECT 1", "cache": "read-write" })).unwrap();
        assert_eq!(request.cache, CacheMode::ReadWrite);

        let request: QueryRequest =
            serde_json::from_value(json!({ "sql": "SELECT 1" })).unwrap();
        assert_eq!(request.cache, CacheMode::Off);
    }

    #[test]
    fn test_bad_tx_handle() {
        assert!(parse_tx_handle("not-a-uuid").is_err());
        assert!(parse_tx_handle(&Uuid::new_v4().to_string()).is_ok());
    }
}
