//! Audit logging for policy-gated commands.
//!
//! Append-only: an in-memory ring with configurable capacity, plus an
//! optional NDJSON file for externalization. All writes go through
//! [`AuditLog::record`], the single write path shared by the dispatcher and
//! the policy engine.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::engine::{Decision, RiskLevel};

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub tool: String,
    pub target: String,
    /// Snapshot of the command as evaluated.
    pub command: serde_json::Value,
    pub decision: Decision,
    pub risk: RiskLevel,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Principal that confirmed the action, when confirmation was involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_by: Option<String>,
}

/// Append-only audit log.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    next_id: AtomicU64,
    file: Option<Mutex<BufWriter<File>>>,
}

impl AuditLog {
    pub fn new(capacity: usize, file_path: Option<PathBuf>) -> std::io::Result<Self> {
        let file = match file_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        };

        Ok(Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            file,
        })
    }

    /// Append an entry, returning its id.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        tool: &str,
        target: &str,
        command: serde_json::Value,
        decision: Decision,
        risk: RiskLevel,
        success: bool,
        error: Option<String>,
        confirmed_by: Option<String>,
    ) -> u64 {
        let entry = AuditEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            ts: Utc::now(),
            tool: tool.to_string(),
            target: target.to_string(),
            command,
            decision,
            risk,
            success,
            error,
            confirmed_by,
        };
        let id = entry.id;

        if let Some(file) = &self.file {
            if let Ok(line) = serde_json::to_string(&entry) {
                let mut writer = file.lock().expect("audit file lock");
                if writeln!(writer, "{line}").and_then(|_| writer.flush()).is_err() {
                    warn!("failed to append audit entry {} to file", id);
                }
            }
        }

        let mut ring = self.ring.lock().expect("audit ring lock");
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);

        id
    }

    /// Most recent entries, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let ring = self.ring.lock().expect("audit ring lock");
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("audit ring lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_recent() {
        let log = AuditLog::new(10, None).unwrap();
        let id = log.record(
            "home_unlock",
            "door_front",
            json!({"action": "unlock"}),
            Decision::Allow,
            RiskLevel::High,
            true,
            None,
            Some("local".into()),
        );
        assert_eq!(id, 1);

        let entries = log.recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool, "home_unlock");
        assert_eq!(entries[0].risk, RiskLevel::High);
    }

    #[test]
    fn test_ring_capacity() {
        let log = AuditLog::new(3, None).unwrap();
        for i in 0..5 {
            log.record(
                "t",
                &format!("target{i}"),
                json!({}),
                Decision::Allow,
                RiskLevel::Safe,
                true,
                None,
                None,
            );
        }
        let entries = log.recent(10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].target, "target2");
        assert_eq!(entries[2].target, "target4");
    }

    #[test]
    fn test_file_externalization() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("audit.ndjson");
        let log = AuditLog::new(10, Some(path.clone())).unwrap();

        log.record(
            "db_execute",
            "orders",
            json!({"sql": "UPDATE orders SET x = 1"}),
            Decision::Deny,
            RiskLevel::Medium,
            false,
            Some("denied by policy".into()),
            None,
        );

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("db_execute"));
        assert!(content.contains("DENY"));
    }
}
