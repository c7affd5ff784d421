//! Database layer for the Meridian MCP servers.
//!
//! Owns connection pools (one active at a time), circuit breaking, statement
//! execution with positional binding, transactional batches, migrations, and
//! the LISTEN bridge that feeds change events to subscribers.
//!
//! # Example
//!
//! ```rust,ignore
//! use meridian_db::{ConnectionManager, PoolSettings, query};
//!
//! let manager = ConnectionManager::new(PoolSettings::default());
//! let id = manager.add_connection("postgres://u:p@h/db", None).await?;
//! let pool = manager.active_pool()?;
//! let out = query::run_query(pool.pool(), "SELECT 1 AS v", &[], &Default::default()).await?;
//! ```

pub mod breaker;
pub mod error;
pub mod listen;
pub mod manager;
pub mod migrate;
pub mod query;
pub mod sql_guard;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use error::{DbError, Result};
pub use listen::{ChangeEvent, DbListener};
pub use manager::{ConnectionInfo, ConnectionManager, ManagedPool, PoolSettings, PoolStats};
pub use query::{
    copy_in_csv, run_batch, run_execute, run_explain, run_query, stream_fold, FieldDesc,
    QueryOptions, QueryOutput, TransactionRegistry,
};
pub use sql_guard::{apply_row_limit, bind_parameters, is_cacheable, validate_read_only};
