//! iOS automation core.
//!
//! Three pieces: simulator discovery and boot via `simctl`, a supervised
//! per-device test-runner subprocess proxying automation commands over
//! HTTP, and a WebKit inspector proxy whose WebSocket debugger sessions
//! carry screenshot and script evaluation.

pub mod error;
pub mod inspector;
pub mod runner;
pub mod simctl;

pub use error::{AutomationError, Result};
pub use inspector::{InspectorConfig, InspectorProxy, InspectorSession, TargetInfo};
pub use runner::{needs_session_swap, RunnerConfig, RunnerSupervisor, Session};
pub use simctl::{ensure_booted, list_devices, parse_device_list, DeviceInfo, DeviceState};
