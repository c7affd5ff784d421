//! Policy, confirmation, and audit subsystem.
//!
//! Every mutating tool call is evaluated here before execution. Decisions
//! and confirmations are recorded in the append-only audit log; HIGH-risk
//! actions round-trip through short-lived confirmation tokens.

pub mod audit;
pub mod condition;
pub mod confirm;
pub mod engine;

pub use audit::{AuditEntry, AuditLog};
pub use condition::{Comparator, Condition};
pub use confirm::{ConfirmationManager, PendingAction};
pub use engine::{
    local_time_of_day, CommandRequest, Decision, Evaluation, NumericBounds, Policy,
    PolicyDefaults, PolicyEngine, PolicyMatcher, QuietHours, RiskLevel,
};
