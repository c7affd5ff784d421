//! Statement execution: dynamic row decoding, prepared parameter binding,
//! deadlines, transactional batches, and EXPLAIN passthrough.
//!
//! Parameters always reach the driver positionally; SQL text is never
//! interpolated. Dropping an in-flight fetch on deadline closes the borrowed
//! connection, which terminates the statement server-side.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

use crate::error::{DbError, Result};

/// Options for a single statement execution.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Statement deadline. `None` means no deadline.
    pub timeout: Option<Duration>,
    /// Hard cap on returned rows.
    pub row_limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            row_limit: 10_000,
        }
    }
}

/// Column descriptor in a query result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldDesc {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Decoded result of a statement.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryOutput {
    pub columns: Vec<FieldDesc>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

impl QueryOutput {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

/// Bind a JSON value to the next positional placeholder, preserving the
/// driver-native type where one exists.
fn bind_value<'q>(query: PgQuery<'q>, value: &'q Value) -> Result<PgQuery<'q>> {
    Ok(match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                return Err(DbError::invalid(format!("unrepresentable number: {n}")));
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(value)),
    })
}

fn build_query<'q>(sql: &'q str, params: &'q [Value]) -> Result<PgQuery<'q>> {
    let mut query = sqlx::query(sql);
    for value in params {
        query = bind_value(query, value)?;
    }
    Ok(query)
}

/// Decode one column of a row into JSON, driven by the reported type.
fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Value {
    macro_rules! take {
        ($ty:ty, $conv:expr) => {
            match row.try_get::<Option<$ty>, _>(idx) {
                Ok(Some(v)) => return $conv(v),
                Ok(None) => return Value::Null,
                Err(_) => {}
            }
        };
    }

    match type_name {
        "BOOL" => take!(bool, Value::Bool),
        "INT2" => take!(i16, |v: i16| Value::from(v)),
        "INT4" => take!(i32, |v: i32| Value::from(v)),
        "INT8" => take!(i64, Value::from),
        "FLOAT4" => take!(f32, |v: f32| Value::from(v as f64)),
        "FLOAT8" => take!(f64, Value::from),
        "NUMERIC" => {
            take!(sqlx::types::BigDecimal, |v: sqlx::types::BigDecimal| {
                let text = v.to_string();
                match text.parse::<f64>() {
                    Ok(f) if f.is_finite() => Value::from(f),
                    _ => Value::String(text),
                }
            })
        }
        "UUID" => take!(Uuid, |v: Uuid| Value::String(v.to_string())),
        "JSON" | "JSONB" => take!(Value, |v| v),
        "TIMESTAMPTZ" => {
            take!(chrono::DateTime<chrono::Utc>, |v: chrono::DateTime<
                chrono::Utc,
            >| Value::String(
                v.to_rfc3339()
            ))
        }
        "TIMESTAMP" => {
            take!(chrono::NaiveDateTime, |v: chrono::NaiveDateTime| {
                Value::String(v.to_string())
            })
        }
        "DATE" => take!(chrono::NaiveDate, |v: chrono::NaiveDate| Value::String(
            v.to_string()
        )),
        "TIME" => take!(chrono::NaiveTime, |v: chrono::NaiveTime| Value::String(
            v.to_string()
        )),
        "BYTEA" => take!(Vec<u8>, |v: Vec<u8>| Value::String(hex::encode(v))),
        _ => {}
    }

    // Text-ish and unknown types: fall back to a string decode.
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(s)) => Value::String(s),
        Ok(None) => Value::Null,
        Err(_) => Value::Null,
    }
}

fn decode_rows(rows: &[PgRow]) -> (Vec<FieldDesc>, Vec<Map<String, Value>>) {
    let columns: Vec<FieldDesc> = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|col| FieldDesc {
                    name: col.name().to_string(),
                    type_name: col.type_info().name().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let decoded = rows
        .iter()
        .map(|row| {
            let mut obj = Map::new();
            for (idx, col) in row.columns().iter().enumerate() {
                obj.insert(
                    col.name().to_string(),
                    decode_column(row, idx, col.type_info().name()),
                );
            }
            obj
        })
        .collect();

    (columns, decoded)
}

async fn with_deadline<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(format!(
                "statement exceeded {}ms",
                limit.as_millis()
            ))),
        },
        None => fut.await,
    }
}

/// Run one statement and decode its rows.
pub async fn run_query(
    pool: &PgPool,
    sql: &str,
    params: &[Value],
    opts: &QueryOptions,
) -> Result<QueryOutput> {
    let start = Instant::now();

    let rows = with_deadline(opts.timeout, async {
        let query = build_query(sql, params)?;
        Ok(query.fetch_all(pool).await?)
    })
    .await?;

    let truncated = rows.len() > opts.row_limit;
    let kept = if truncated {
        &rows[..opts.row_limit]
    } else {
        &rows[..]
    };
    let (columns, decoded) = decode_rows(kept);

    Ok(QueryOutput {
        columns,
        row_count: decoded.len(),
        rows: decoded,
        truncated,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Run a mutating statement, returning rows affected.
pub async fn run_execute(
    pool: &PgPool,
    sql: &str,
    params: &[Value],
    opts: &QueryOptions,
) -> Result<u64> {
    with_deadline(opts.timeout, async {
        let query = build_query(sql, params)?;
        let result = query.execute(pool).await?;
        Ok(result.rows_affected())
    })
    .await
}

/// EXPLAIN passthrough: returns planner output lines unchanged.
pub async fn run_explain(
    pool: &PgPool,
    sql: &str,
    params: &[Value],
    analyze: bool,
    opts: &QueryOptions,
) -> Result<Vec<String>> {
    let statement = if analyze {
        format!("EXPLAIN ANALYZE {sql}")
    } else {
        format!("EXPLAIN {sql}")
    };

    with_deadline(opts.timeout, async {
        let query = build_query(&statement, params)?;
        let rows = query.fetch_all(pool).await?;
        let mut lines = Vec::with_capacity(rows.len());
        for row in &rows {
            lines.push(row.try_get::<String, _>(0)?);
        }
        Ok(lines)
    })
    .await
}

/// Stream a statement in batches and fold them into an accumulator without
/// materializing the full result set.
pub async fn stream_fold<T, F>(
    pool: &PgPool,
    sql: &str,
    params: &[Value],
    batch_size: usize,
    init: T,
    mut step: F,
) -> Result<(T, u64)>
where
    F: FnMut(T, Vec<Map<String, Value>>) -> Result<T>,
{
    let query = build_query(sql, params)?;
    let mut stream = query.fetch(pool);

    let mut acc = init;
    let mut total: u64 = 0;
    let mut batch: Vec<PgRow> = Vec::with_capacity(batch_size);

    while let Some(row) = stream.try_next().await? {
        batch.push(row);
        if batch.len() >= batch_size {
            total += batch.len() as u64;
            let (_, decoded) = decode_rows(&batch);
            acc = step(acc, decoded)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        total += batch.len() as u64;
        let (_, decoded) = decode_rows(&batch);
        acc = step(acc, decoded)?;
    }

    Ok((acc, total))
}

/// All-or-nothing batch: every statement commits or none do. On failure the
/// zero-based index of the failing statement is returned with the error.
pub async fn run_batch(
    pool: &PgPool,
    statements: &[(String, Vec<Value>)],
) -> std::result::Result<Vec<u64>, (usize, DbError)> {
    // Dropping `tx` on any error path rolls the whole batch back.
    let mut tx = pool.begin().await.map_err(|e| (0, DbError::Sqlx(e)))?;
    let mut affected = Vec::with_capacity(statements.len());

    for (idx, (sql, params)) in statements.iter().enumerate() {
        let query = match build_query(sql, params) {
            Ok(q) => q,
            Err(e) => return Err((idx, e)),
        };
        match query.execute(&mut *tx).await {
            Ok(result) => affected.push(result.rows_affected()),
            Err(e) => return Err((idx, DbError::Sqlx(e))),
        }
    }

    tx.commit().await.map_err(|e| (statements.len(), DbError::Sqlx(e)))?;
    Ok(affected)
}

/// COPY-based bulk load for CSV payloads. Falls back to parameterized
/// INSERT at the tool layer when the payload is row-structured instead.
pub async fn copy_in_csv(
    pool: &PgPool,
    table: &str,
    columns: &[String],
    csv_data: &str,
) -> Result<u64> {
    use sqlx::postgres::PgPoolCopyExt;

    let column_list = columns.join(", ");
    let statement = format!("COPY {table} ({column_list}) FROM STDIN WITH (FORMAT csv)");

    let mut sink = pool.copy_in_raw(&statement).await?;
    sink.send(csv_data.as_bytes()).await?;
    let rows = sink.finish().await?;
    Ok(rows)
}

// ============================================================================
// Transaction handles
// ============================================================================

struct TxEntry {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
    created: Instant,
}

/// Registry of open transactions addressable from multiple tool calls.
///
/// Statements within one handle are strictly ordered: the registry lock
/// serializes access per handle. Handles expire after `ttl` and are swept
/// lazily.
pub struct TransactionRegistry {
    inner: tokio::sync::Mutex<HashMap<Uuid, TxEntry>>,
    ttl: Duration,
}

impl TransactionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn begin(&self, pool: &PgPool) -> Result<Uuid> {
        let tx = pool.begin().await?;
        let id = Uuid::new_v4();
        let mut map = self.inner.lock().await;
        self.sweep_locked(&mut map);
        map.insert(
            id,
            TxEntry {
                tx,
                created: Instant::now(),
            },
        );
        Ok(id)
    }

    pub async fn query_in(
        &self,
        id: Uuid,
        sql: &str,
        params: &[Value],
        row_limit: usize,
    ) -> Result<QueryOutput> {
        let start = Instant::now();
        let mut map = self.inner.lock().await;
        let entry = map
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found(format!("no such transaction: {id}")))?;

        let query = build_query(sql, params)?;
        let rows = query.fetch_all(&mut *entry.tx).await?;

        let truncated = rows.len() > row_limit;
        let kept = if truncated { &rows[..row_limit] } else { &rows[..] };
        let (columns, decoded) = decode_rows(kept);

        Ok(QueryOutput {
            columns,
            row_count: decoded.len(),
            rows: decoded,
            truncated,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub async fn execute_in(&self, id: Uuid, sql: &str, params: &[Value]) -> Result<u64> {
        let mut map = self.inner.lock().await;
        let entry = map
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found(format!("no such transaction: {id}")))?;
        let query = build_query(sql, params)?;
        let result = query.execute(&mut *entry.tx).await?;
        Ok(result.rows_affected())
    }

    pub async fn commit(&self, id: Uuid) -> Result<()> {
        let entry = self.take(id).await?;
        entry.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&self, id: Uuid) -> Result<()> {
        let entry = self.take(id).await?;
        entry.tx.rollback().await?;
        Ok(())
    }

    /// Number of open handles (expired ones swept first).
    pub async fn open_count(&self) -> usize {
        let mut map = self.inner.lock().await;
        self.sweep_locked(&mut map);
        map.len()
    }

    async fn take(&self, id: Uuid) -> Result<TxEntry> {
        let mut map = self.inner.lock().await;
        map.remove(&id)
            .ok_or_else(|| DbError::not_found(format!("no such transaction: {id}")))
    }

    fn sweep_locked(&self, map: &mut HashMap<Uuid, TxEntry>) {
        map.retain(|_, entry| entry.created.elapsed() < self.ttl);
    }
}
