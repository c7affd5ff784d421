//! Server configuration.
//!
//! Read once from the environment at startup into an explicit value that is
//! threaded through construction. Loading a dotenv file is the launcher's
//! job; the server only consults the process environment.

use std::path::PathBuf;
use std::time::Duration;

use meridian_automation::{InspectorConfig, RunnerConfig};
use meridian_cache::CacheConfig;
use meridian_db::PoolSettings;
use meridian_tenancy::{RateLimiterConfig, Tier};

/// Dispatcher mode: many direct tools, or one code-execution tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Tools,
    CodeApi,
}

/// Evaluator mode: per-invocation scratch jail, or the configured workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Sandbox,
    Direct,
}

/// Integration tokens. Absence disables the corresponding plugin's tools at
/// registration time.
#[derive(Debug, Clone, Default)]
pub struct IntegrationTokens {
    pub shopify: Option<String>,
    pub amazon: Option<String>,
    pub fedex: Option<String>,
    pub quickbooks: Option<String>,
}

/// Sandbox execution limits.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub wall_clock: Duration,
    /// Soft cap on bytes of materialized step output.
    pub memory_soft_bytes: usize,
    pub batch_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(30),
            memory_soft_bytes: 64 * 1024 * 1024,
            batch_size: 1000,
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_name: String,
    pub server_version: String,
    pub mode: ServerMode,
    pub exec_mode: ExecMode,
    pub log_level: Option<String>,

    pub database_url: Option<String>,
    pub pool: PoolSettings,
    pub migrations_dir: PathBuf,

    pub cache: CacheConfig,
    pub rate_limit: RateLimiterConfig,
    pub default_tier: Tier,
    pub tokens: IntegrationTokens,

    pub runner: RunnerConfig,
    pub inspector: InspectorConfig,

    pub sandbox: SandboxLimits,
    pub scratch_dir: PathBuf,
    pub workspace_dir: PathBuf,

    pub subscription_buffer: usize,
    pub subscription_stall: Duration,

    pub audit_capacity: usize,
    pub audit_file: Option<PathBuf>,
    pub confirmation_ttl: Duration,
    pub confirmation_capacity: usize,

    pub max_response_bytes: usize,
    pub max_rows: usize,
    pub transaction_ttl: Duration,
    pub drain_window: Duration,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env(name).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let home = meridian_logging::meridian_home();

        let mode = match env("MCP_MODE").as_deref() {
            Some("code-api") => ServerMode::CodeApi,
            _ => ServerMode::Tools,
        };
        let exec_mode = match env("CODE_EXECUTION_MODE").as_deref() {
            Some("direct") => ExecMode::Direct,
            _ => ExecMode::Sandbox,
        };

        let default_tier = match env("RATE_LIMIT_DEFAULT_TIER").as_deref() {
            Some("free") => Tier::Free,
            Some("premium") => Tier::Premium,
            Some("enterprise") => Tier::Enterprise,
            _ => Tier::Standard,
        };

        let runner = RunnerConfig {
            project_path: env("IOS_RUNNER_PATH")
                .unwrap_or_else(|| RunnerConfig::default().project_path),
            scheme: env("IOS_RUNNER_SCHEME").unwrap_or_else(|| RunnerConfig::default().scheme),
            base_port: env_parse("IOS_BASE_PORT", 8100),
            startup_timeout: Duration::from_secs(env_parse("IOS_STARTUP_TIMEOUT_SECS", 60)),
            command_timeout: Duration::from_secs(env_parse("IOS_SESSION_TIMEOUT_SECS", 30)),
            default_bundle_id: env("IOS_DEFAULT_BUNDLE_ID")
                .unwrap_or_else(|| RunnerConfig::default().default_bundle_id),
        };

        let inspector = InspectorConfig {
            port: env_parse("IOS_INSPECTOR_PORT", 9221),
            ..InspectorConfig::default()
        };

        Self {
            server_name: "meridian-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            mode,
            exec_mode,
            log_level: env("LOG_LEVEL"),

            database_url: env("DATABASE_URL"),
            pool: PoolSettings::default(),
            migrations_dir: env("MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("migrations")),

            cache: CacheConfig {
                enabled: env_bool("CACHE_ENABLED", true),
                default_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", 300)),
                max_entries: env_parse("CACHE_MAX_ENTRIES", 1024),
            },
            rate_limit: RateLimiterConfig {
                enabled: env_bool("RATE_LIMIT_ENABLED", true),
                max_wait: Duration::from_millis(env_parse("RATE_LIMIT_MAX_WAIT_MS", 2000)),
            },
            default_tier,
            tokens: IntegrationTokens {
                shopify: env("SHOPIFY_TOKEN"),
                amazon: env("AMAZON_TOKEN"),
                fedex: env("FEDEX_TOKEN"),
                quickbooks: env("QUICKBOOKS_TOKEN"),
            },

            runner,
            inspector,

            sandbox: SandboxLimits {
                wall_clock: Duration::from_secs(env_parse("CODE_WALL_CLOCK_SECS", 30)),
                memory_soft_bytes: env_parse("CODE_MEMORY_SOFT_BYTES", 64 * 1024 * 1024),
                batch_size: env_parse("CODE_BATCH_SIZE", 1000),
            },
            scratch_dir: home.join("scratch"),
            workspace_dir: env("WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),

            subscription_buffer: env_parse("SUBSCRIPTION_BUFFER", 1024),
            subscription_stall: Duration::from_secs(env_parse("SUBSCRIPTION_STALL_SECS", 300)),

            audit_capacity: env_parse("AUDIT_CAPACITY", 1000),
            audit_file: Some(home.join("audit.ndjson")),
            confirmation_ttl: Duration::from_secs(env_parse("CONFIRMATION_TTL_SECS", 300)),
            confirmation_capacity: 64,

            max_response_bytes: env_parse("MAX_RESPONSE_BYTES", 1024 * 1024),
            max_rows: env_parse("MAX_ROWS", 10_000),
            transaction_ttl: Duration::from_secs(env_parse("TRANSACTION_TTL_SECS", 120)),
            drain_window: Duration::from_secs(env_parse("DRAIN_WINDOW_SECS", 10)),
        }
    }

    /// Configuration for tests: everything local and small.
    pub fn for_tests(home: &std::path::Path) -> Self {
        std::env::remove_var("MCP_MODE");
        let mut config = Self::from_env();
        config.database_url = None;
        config.audit_file = None;
        config.scratch_dir = home.join("scratch");
        config.workspace_dir = home.to_path_buf();
        config.migrations_dir = home.join("migrations");
        config.confirmation_ttl = Duration::from_secs(5);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_env();
        assert_eq!(config.server_name, "meridian-mcp");
        assert_eq!(config.sandbox.batch_size, 1000);
        assert_eq!(config.subscription_buffer, 1024);
        assert!(config.max_rows >= 1000);
    }

    #[test]
    fn test_env_bool_parsing() {
        assert!(env_bool("MERIDIAN_TEST_UNSET_FLAG", true));
        assert!(!env_bool("MERIDIAN_TEST_UNSET_FLAG", false));
    }
}
