//! In-memory server metrics.
//!
//! Plain atomic counters, single writer per call site, read by health
//! reports and the `server_stats` tool.

use std::sync::atomic::{AtomicU64, Ordering};

/// Server-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    pub tool_calls: AtomicU64,
    pub tool_errors: AtomicU64,
    pub schema_rejections: AtomicU64,
    pub queries: AtomicU64,
    pub statements_executed: AtomicU64,
    pub events_dispatched: AtomicU64,
    pub events_dropped: AtomicU64,
    pub subscribers_disconnected: AtomicU64,
    pub policy_denials: AtomicU64,
    pub confirmations_issued: AtomicU64,
    pub rate_limited: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for health reports.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "tool_calls": self.tool_calls.load(Ordering::Relaxed),
            "tool_errors": self.tool_errors.load(Ordering::Relaxed),
            "schema_rejections": self.schema_rejections.load(Ordering::Relaxed),
            "queries": self.queries.load(Ordering::Relaxed),
            "statements_executed": self.statements_executed.load(Ordering::Relaxed),
            "events_dispatched": self.events_dispatched.load(Ordering::Relaxed),
            "events_dropped": self.events_dropped.load(Ordering::Relaxed),
            "subscribers_disconnected": self.subscribers_disconnected.load(Ordering::Relaxed),
            "policy_denials": self.policy_denials.load(Ordering::Relaxed),
            "confirmations_issued": self.confirmations_issued.load(Ordering::Relaxed),
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
        })
    }
}
