//! Pending-confirmation tokens for high-risk actions.
//!
//! A REQUIRE_CONFIRMATION verdict stashes the command here and hands the
//! caller an opaque token. The follow-up call consumes the token exactly
//! once; expired or already-consumed tokens fail with the appropriate code.
//! The map is bounded: expired entries are swept first, and a full map
//! refuses new pending actions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use meridian_protocol::{ErrorCode, ToolError};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::RiskLevel;

/// A stashed action awaiting confirmation.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub token: String,
    pub tool: String,
    pub command: Value,
    pub risk: RiskLevel,
    pub pin: Option<String>,
    created: Instant,
    expires_at: Instant,
}

impl PendingAction {
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Bounded, expiring store of pending actions.
pub struct ConfirmationManager {
    pending: Mutex<HashMap<String, PendingAction>>,
    capacity: usize,
    ttl: Duration,
}

impl ConfirmationManager {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Stash a command, returning its confirmation token.
    pub fn create(
        &self,
        tool: &str,
        command: Value,
        risk: RiskLevel,
        pin: Option<String>,
    ) -> Result<String, ToolError> {
        let mut pending = self.pending.lock().expect("confirmation lock");
        let now = Instant::now();
        pending.retain(|_, action| action.expires_at > now);

        if pending.len() >= self.capacity {
            return Err(ToolError::resource_exhausted(
                "too many pending confirmations; retry after one expires",
            ));
        }

        let token = Uuid::new_v4().to_string();
        pending.insert(
            token.clone(),
            PendingAction {
                token: token.clone(),
                tool: tool.to_string(),
                command,
                risk,
                pin,
                created: now,
                expires_at: now + self.ttl,
            },
        );
        Ok(token)
    }

    /// Consume a token, returning the stashed action. Each token works at
    /// most once.
    pub fn consume(&self, token: &str, pin: Option<&str>) -> Result<PendingAction, ToolError> {
        let mut pending = self.pending.lock().expect("confirmation lock");

        let Some(action) = pending.get(token) else {
            return Err(ToolError::not_found("unknown confirmation token"));
        };

        if action.expires_at <= Instant::now() {
            pending.remove(token);
            return Err(ToolError::new(
                ErrorCode::DeadlineExceeded,
                "confirmation token expired",
            ));
        }

        if let Some(required) = &action.pin {
            if pin != Some(required.as_str()) {
                return Err(ToolError::permission_denied("confirmation PIN mismatch"));
            }
        }

        Ok(pending.remove(token).expect("checked above"))
    }

    /// Number of live pending actions.
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().expect("confirmation lock");
        let now = Instant::now();
        pending.retain(|_, action| action.expires_at > now);
        pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(ttl_ms: u64) -> ConfirmationManager {
        ConfirmationManager::new(4, Duration::from_millis(ttl_ms))
    }

    #[test]
    fn test_create_then_consume_once() {
        let mgr = manager(1000);
        let token = mgr
            .create("home_unlock", json!({"target": "door_front"}), RiskLevel::High, None)
            .unwrap();

        let action = mgr.consume(&token, None).unwrap();
        assert_eq!(action.tool, "home_unlock");
        assert_eq!(action.command["target"], "door_front");

        // Second consume fails.
        let err = mgr.consume(&token, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_expired_token() {
        let mgr = manager(1);
        let token = mgr
            .create("home_unlock", json!({}), RiskLevel::High, None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let err = mgr.consume(&token, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeadlineExceeded);
    }

    #[test]
    fn test_pin_enforced() {
        let mgr = manager(1000);
        let token = mgr
            .create("home_unlock", json!({}), RiskLevel::High, Some("1234".into()))
            .unwrap();

        let err = mgr.consume(&token, Some("9999")).unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);

        // Wrong PIN did not consume the token.
        assert!(mgr.consume(&token, Some("1234")).is_ok());
    }

    #[test]
    fn test_capacity_bound() {
        let mgr = manager(60_000);
        for _ in 0..4 {
            mgr.create("t", json!({}), RiskLevel::High, None).unwrap();
        }
        let err = mgr.create("t", json!({}), RiskLevel::High, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceExhausted);
    }

    #[test]
    fn test_expired_entries_swept_on_create() {
        let mgr = manager(1);
        for _ in 0..4 {
            mgr.create("t", json!({}), RiskLevel::High, None).unwrap();
        }
        std::thread::sleep(Duration::from_millis(10));
        // Capacity freed by expiry sweep.
        assert!(mgr.create("t", json!({}), RiskLevel::High, None).is_ok());
        assert_eq!(mgr.pending_count(), 1);
    }
}
