//! Centralized configuration management for regtrack
//!
//! This crate provides a unified configuration system with type-safe,
//! validated configuration loaded once at startup and immutable afterwards.
//!
//! Configuration follows a simple hierarchy:
//! 1. Safe defaults (defined as constants)
//! 2. Environment variable overrides
//! 3. Runtime validation
//!
//! Each subsystem validates its own section; a section that fails
//! validation keeps that subsystem from starting without taking the whole
//! process down.

pub mod error;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use validation::Validate;

// =============================================================================
// SAFE DEFAULTS - Work for any environment (dev, staging, prod, test)
// =============================================================================

// Database configuration (embedded store, WAL journaling)
const DEFAULT_DATABASE_URL: &str = "sqlite://regtrack.db";
const DEFAULT_DB_READ_POOL_SIZE: u32 = 8;
const DEFAULT_DB_BUSY_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_AUTO_MIGRATE: bool = true;

// Jenkins client
const DEFAULT_JENKINS_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_JENKINS_RETRY_BACKOFF_MS: u64 = 500;

// Polling / scheduler
const DEFAULT_POLLING_INTERVAL_HOURS: u64 = 12;
const DEFAULT_MODULE_FAN_OUT: usize = 4;
const DEFAULT_HTTP_DRAIN_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_IMPORT_DRAIN_TIMEOUT_SECONDS: u64 = 300;

// Import service
/// Rows per bulk insert batch during import
pub const IMPORT_BATCH_SIZE: usize = 5_000;

// Background jobs
const DEFAULT_WORKER_COUNT: usize = 2;
const DEFAULT_JOB_TTL_HOURS: u64 = 24;
const DEFAULT_LOG_TTL_HOURS: u64 = 1;
const DEFAULT_LOG_QUEUE_CAPACITY: usize = 1_000;

// Analytics cache
const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;
const DEFAULT_CACHE_SWEEP_INTERVAL_SECONDS: u64 = 60;

// Flaky detection window
/// Number of most recent jobs considered when classifying a test as flaky
pub const FLAKY_WINDOW: usize = 5;

// Metadata synchronizer failure thresholds
/// Sync aborts when the per-file failure rate exceeds this fraction...
pub const SYNC_MAX_FILE_FAILURE_RATE: f64 = 0.10;
/// ...and more than this many files have failed
pub const SYNC_MIN_FAILED_FILES: usize = 5;
/// Sync aborts when the batch write failure rate exceeds this fraction...
pub const SYNC_MAX_BATCH_FAILURE_RATE: f64 = 0.10;
/// ...and more than this many batches have failed
pub const SYNC_MIN_FAILED_BATCHES: usize = 2;
/// Retry budget for transient git/IO failures
pub const SYNC_MAX_RETRIES: u32 = 3;
/// Initial retry delay; doubles on each attempt
pub const SYNC_RETRY_INITIAL_DELAY_SECONDS: u64 = 60;
/// Per git operation wall-clock budget
pub const GIT_OPERATION_TIMEOUT_SECONDS: u64 = 300;
/// Largest mirror the synchronizer will keep on disk
pub const GIT_MAX_REPO_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
/// Shallow clone depth for the metadata mirror
pub const GIT_CLONE_DEPTH: i32 = 50;
const DEFAULT_METADATA_SYNC_INTERVAL_HOURS: u64 = 24;

// Test discovery
const DEFAULT_TEST_ROOT_PREFIX: &str = "tests";

/// Core configuration for the entire regtrack application
///
/// All settings have safe defaults and can be overridden via environment
/// variables. Loaded once at startup; immutable afterwards.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplicationConfig {
    /// Embedded database configuration
    pub database: DatabaseConfig,

    /// Jenkins CI server access
    pub jenkins: JenkinsConfig,

    /// Build polling and import scheduling
    pub polling: PollingConfig,

    /// Background job tracking and worker pool
    pub jobs: JobTrackerConfig,

    /// Analytics response cache
    pub cache: CacheConfig,

    /// Test metadata git mirror and discovery
    pub metadata: MetadataConfig,

    /// Admin credential digest
    pub admin: AdminConfig,
}

impl ApplicationConfig {
    /// Load the full configuration from the environment
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            jenkins: JenkinsConfig::from_env(),
            polling: PollingConfig::from_env(),
            jobs: JobTrackerConfig::from_env(),
            cache: CacheConfig::from_env(),
            metadata: MetadataConfig::from_env(),
            admin: AdminConfig::from_env(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|s| match s.as_str() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    })
}

/// Embedded database configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (`sqlite://path` or `sqlite::memory:`)
    pub url: String,
    /// Maximum connections in the read pool
    pub read_pool_size: u32,
    /// SQLite busy timeout in seconds
    pub busy_timeout_seconds: u64,
    /// Apply pending migrations at startup
    pub auto_migrate: bool,
}

impl DatabaseConfig {
    /// Load from environment with safe defaults
    pub fn from_env() -> Self {
        Self {
            url: env_string("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            read_pool_size: env_parse("REGTRACK_DB_READ_POOL_SIZE")
                .unwrap_or(DEFAULT_DB_READ_POOL_SIZE),
            busy_timeout_seconds: env_parse("REGTRACK_DB_BUSY_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_DB_BUSY_TIMEOUT_SECONDS),
            auto_migrate: env_bool("REGTRACK_AUTO_MIGRATE").unwrap_or(DEFAULT_AUTO_MIGRATE),
        }
    }
}

impl Validate for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_non_empty(&self.url, "database.url")?;
        if !self.url.starts_with("sqlite:") {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
            });
        }
        validation::validate_range(
            u64::from(self.read_pool_size),
            1,
            64,
            "database.read_pool_size",
        )?;
        Ok(())
    }
}

/// Jenkins CI server access configuration
///
/// Credentials live in process memory only and MUST NOT be persisted; the
/// `Debug` impl redacts the token so it never reaches logs.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct JenkinsConfig {
    /// Base URL of the Jenkins instance
    pub base_url: String,
    /// Basic auth user
    pub user: String,
    /// Basic auth API token
    pub api_token: String,
    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,
    /// Initial backoff before the single idempotent retry, in milliseconds
    pub retry_backoff_ms: u64,
}

impl std::fmt::Debug for JenkinsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JenkinsConfig")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("api_token", &"<redacted>")
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

impl JenkinsConfig {
    /// Load from environment with safe defaults
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("JENKINS_URL").unwrap_or_default(),
            user: env_string("JENKINS_USER").unwrap_or_default(),
            api_token: env_string("JENKINS_API_TOKEN").unwrap_or_default(),
            request_timeout_seconds: env_parse("REGTRACK_JENKINS_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_JENKINS_REQUEST_TIMEOUT_SECONDS),
            retry_backoff_ms: env_parse("REGTRACK_JENKINS_RETRY_BACKOFF_MS")
                .unwrap_or(DEFAULT_JENKINS_RETRY_BACKOFF_MS),
        }
    }
}

impl Validate for JenkinsConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_url(&self.base_url, "jenkins.base_url")?;
        validation::validate_non_empty(&self.user, "jenkins.user")?;
        validation::validate_non_empty(&self.api_token, "jenkins.api_token")?;
        validation::validate_range(
            self.request_timeout_seconds,
            1,
            600,
            "jenkins.request_timeout_seconds",
        )?;
        Ok(())
    }
}

/// Build polling and import scheduling configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PollingConfig {
    /// Automatic polling enabled
    pub auto_update_enabled: bool,
    /// Polling interval in minutes (hours setting wins; legacy minutes honored)
    pub interval_minutes: u64,
    /// Concurrent module imports within one parent build
    pub module_fan_out: usize,
    /// Graceful drain budget for in-flight HTTP on shutdown, seconds
    pub http_drain_timeout_seconds: u64,
    /// Graceful drain budget for in-flight imports on shutdown, seconds
    pub import_drain_timeout_seconds: u64,
}

impl PollingConfig {
    /// Load from environment with safe defaults
    ///
    /// `POLLING_INTERVAL_HOURS` is the supported setting; the legacy
    /// `POLLING_INTERVAL_MINUTES` is still honored when hours is unset.
    pub fn from_env() -> Self {
        let interval_minutes = env_parse::<u64>("POLLING_INTERVAL_HOURS")
            .map(|h| h.saturating_mul(60))
            .or_else(|| env_parse::<u64>("POLLING_INTERVAL_MINUTES"))
            .unwrap_or(DEFAULT_POLLING_INTERVAL_HOURS * 60);

        Self {
            auto_update_enabled: env_bool("AUTO_UPDATE_ENABLED").unwrap_or(false),
            interval_minutes,
            module_fan_out: env_parse("REGTRACK_MODULE_FAN_OUT").unwrap_or(DEFAULT_MODULE_FAN_OUT),
            http_drain_timeout_seconds: env_parse("REGTRACK_HTTP_DRAIN_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_HTTP_DRAIN_TIMEOUT_SECONDS),
            import_drain_timeout_seconds: env_parse("REGTRACK_IMPORT_DRAIN_TIMEOUT_SECONDS")
                .unwrap_or(DEFAULT_IMPORT_DRAIN_TIMEOUT_SECONDS),
        }
    }
}

impl Validate for PollingConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(self.interval_minutes, 1, 60 * 24 * 7, "polling.interval")?;
        validation::validate_range(
            self.module_fan_out as u64,
            1,
            64,
            "polling.module_fan_out",
        )?;
        Ok(())
    }
}

/// Backend selection for the background job tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrackerBackend {
    /// In-process map; single-worker deployments
    Memory,
    /// Rows in the shared database file; survives restarts and is visible
    /// to every worker process
    Database,
}

/// Background job tracking and worker pool configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobTrackerConfig {
    /// Which tracker implementation to use
    pub backend: JobTrackerBackend,
    /// Number of background workers consuming the task queue
    pub worker_count: usize,
    /// Job state retention in hours
    pub job_ttl_hours: u64,
    /// Log queue retention in hours
    pub log_ttl_hours: u64,
    /// Per-job log queue capacity before oldest lines are dropped
    pub log_queue_capacity: usize,
}

impl JobTrackerConfig {
    /// Load from environment with safe defaults
    pub fn from_env() -> Self {
        let backend = match env_string("REGTRACK_JOB_TRACKER_BACKEND").as_deref() {
            Some("database") => JobTrackerBackend::Database,
            _ => JobTrackerBackend::Memory,
        };

        Self {
            backend,
            worker_count: env_parse("REGTRACK_WORKER_COUNT").unwrap_or(DEFAULT_WORKER_COUNT),
            job_ttl_hours: env_parse("REGTRACK_JOB_TTL_HOURS").unwrap_or(DEFAULT_JOB_TTL_HOURS),
            log_ttl_hours: env_parse("REGTRACK_LOG_TTL_HOURS").unwrap_or(DEFAULT_LOG_TTL_HOURS),
            log_queue_capacity: env_parse("REGTRACK_LOG_QUEUE_CAPACITY")
                .unwrap_or(DEFAULT_LOG_QUEUE_CAPACITY),
        }
    }
}

impl Validate for JobTrackerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(self.worker_count as u64, 1, 32, "jobs.worker_count")?;
        validation::validate_range(
            self.log_queue_capacity as u64,
            16,
            1_000_000,
            "jobs.log_queue_capacity",
        )?;
        Ok(())
    }
}

/// Analytics response cache configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live in seconds
    pub ttl_seconds: u64,
    /// How often the expirer sweeps dead entries, in seconds
    pub sweep_interval_seconds: u64,
}

impl CacheConfig {
    /// Load from environment with safe defaults
    pub fn from_env() -> Self {
        Self {
            ttl_seconds: env_parse("REGTRACK_CACHE_TTL_SECONDS").unwrap_or(DEFAULT_CACHE_TTL_SECONDS),
            sweep_interval_seconds: env_parse("REGTRACK_CACHE_SWEEP_INTERVAL_SECONDS")
                .unwrap_or(DEFAULT_CACHE_SWEEP_INTERVAL_SECONDS),
        }
    }
}

/// Test metadata mirror and discovery configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MetadataConfig {
    /// Periodic sync enabled
    pub sync_enabled: bool,
    /// Periodic sync interval in hours
    pub sync_interval_hours: u64,
    /// Remote repository URL
    pub git_repo_url: String,
    /// Local mirror directory
    pub git_local_path: String,
    /// Default branch checked out when a release has no branch of its own
    pub git_branch: String,
    /// SSH private key used for fetches; must be mode 0600
    pub git_ssh_key_path: Option<String>,
    /// Directory walked for test discovery, relative to the mirror root
    pub discovery_base_path: String,
    /// Ini file listing staging tests, relative to the mirror root
    pub staging_config_path: Option<String>,
    /// Path prefix under which `testcase_module` is derived from file paths
    pub test_root_prefix: String,
}

impl MetadataConfig {
    /// Load from environment with safe defaults
    pub fn from_env() -> Self {
        Self {
            sync_enabled: env_bool("METADATA_SYNC_ENABLED").unwrap_or(false),
            sync_interval_hours: env_parse("METADATA_SYNC_INTERVAL_HOURS")
                .unwrap_or(DEFAULT_METADATA_SYNC_INTERVAL_HOURS),
            git_repo_url: env_string("GIT_REPO_URL").unwrap_or_default(),
            git_local_path: env_string("GIT_REPO_LOCAL_PATH").unwrap_or_default(),
            git_branch: env_string("GIT_REPO_BRANCH").unwrap_or_else(|| "master".to_string()),
            git_ssh_key_path: env_string("GIT_REPO_SSH_KEY_PATH"),
            discovery_base_path: env_string("TEST_DISCOVERY_BASE_PATH").unwrap_or_default(),
            staging_config_path: env_string("TEST_DISCOVERY_STAGING_CONFIG"),
            test_root_prefix: env_string("REGTRACK_TEST_ROOT_PREFIX")
                .unwrap_or_else(|| DEFAULT_TEST_ROOT_PREFIX.to_string()),
        }
    }
}

impl Validate for MetadataConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_non_empty(&self.git_repo_url, "metadata.git_repo_url")?;
        validation::validate_non_empty(&self.git_local_path, "metadata.git_local_path")?;
        validation::validate_non_empty(&self.discovery_base_path, "metadata.discovery_base_path")?;
        validation::validate_range(
            self.sync_interval_hours,
            1,
            24 * 30,
            "metadata.sync_interval_hours",
        )?;
        Ok(())
    }
}

/// Admin credential configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdminConfig {
    /// Hex SHA-256 digest of the shared admin PIN
    pub pin_hash: String,
}

impl AdminConfig {
    /// Load from environment
    pub fn from_env() -> Self {
        Self {
            pin_hash: env_string("ADMIN_PIN_HASH").unwrap_or_default(),
        }
    }
}

impl Validate for AdminConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_sha256_hex(&self.pin_hash, "admin.pin_hash")
    }
}
