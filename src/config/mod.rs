//! Configuration management for record-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::sync::compare::FieldComparator;
use crate::sync::orchestrator::HISTORICAL_SYNC;
use crate::sync::reconcile::DuplicateKeyPolicy;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Upstream API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Rate limiting applied to every upstream call
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Composite sync plans and job spacing
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Periodic trigger configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Admin HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Entity definitions keyed by job name
    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix RECORD_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // Upstream config from env
        if let Ok(url) = std::env::var("RECORD_SYNC_UPSTREAM_BASE_URL") {
            config.upstream.base_url = url;
        }
        if let Ok(token) = std::env::var("RECORD_SYNC_UPSTREAM_API_TOKEN") {
            config.upstream.api_token = Some(token);
        }

        // Server config from env
        if let Ok(host) = std::env::var("RECORD_SYNC_SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("RECORD_SYNC_SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid port number".to_string()))?;
        }

        // Database config from env
        if let Ok(path) = std::env::var("RECORD_SYNC_DATABASE_PATH") {
            config.database.path = path;
        }

        // Logging config from env
        if let Ok(level) = std::env::var("RECORD_SYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("RECORD_SYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "rate_limit.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.rate_limit.backoff_multiplier.is_finite()
            || self.rate_limit.backoff_multiplier < 1.0
        {
            return Err(ConfigError::InvalidValue(
                "rate_limit.backoff_multiplier must be finite and >= 1.0".to_string(),
            ));
        }
        if self.upstream.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "upstream.page_size must be at least 1".to_string(),
            ));
        }

        for (name, entity) in &self.entities {
            if entity.key_fields.is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "entities.{}.key_fields",
                    name
                )));
            }
            if entity.fields.is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "entities.{}.fields",
                    name
                )));
            }
            for key in &entity.key_fields {
                if !entity.fields.contains_key(key) {
                    return Err(ConfigError::InvalidValue(format!(
                        "entities.{}: key field '{}' is not a mapped field",
                        name, key
                    )));
                }
            }
        }

        for entry in &self.scheduler.schedules {
            if entry.sync_type == HISTORICAL_SYNC {
                return Err(ConfigError::InvalidValue(
                    "scheduler: the historical plan needs a year and cannot be scheduled"
                        .to_string(),
                ));
            }
            if entry.interval_secs == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "scheduler: interval for '{}' must be positive",
                    entry.sync_type
                )));
            }
        }

        Ok(())
    }
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL resources are resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,

    /// Items requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Wait time when rate limited without a Retry-After header (in seconds)
    #[serde(default = "default_rate_limit_wait")]
    pub rate_limit_wait_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            page_size: default_page_size(),
            timeout_secs: default_timeout(),
            rate_limit_wait_secs: default_rate_limit_wait(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_page_size() -> usize {
    500
}

fn default_timeout() -> u64 {
    30
}

fn default_rate_limit_wait() -> u64 {
    60
}

/// Rate limiting and backoff for upstream calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Base delay before every call in milliseconds
    #[serde(default = "default_api_delay")]
    pub api_delay_ms: u64,

    /// Factor the delay grows by after each rate-limited attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Total attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whether to randomize each sleep between 50% and 100% of the delay
    #[serde(default)]
    pub jitter: bool,
}

impl RateLimitConfig {
    /// Base delay as a Duration
    pub fn api_delay(&self) -> Duration {
        Duration::from_millis(self.api_delay_ms)
    }

    /// Delay cap as a Duration
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api_delay_ms: default_api_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter: false,
        }
    }
}

fn default_api_delay() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

/// Composite sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Minimum pause between steps of a composite run in milliseconds
    #[serde(default = "default_job_spacing")]
    pub job_spacing_ms: u64,

    /// Ordered job names per composite sync type
    ///
    /// Setting this replaces the built-in plans entirely.
    #[serde(default = "default_plans")]
    pub plans: BTreeMap<String, Vec<String>>,
}

impl OrchestratorConfig {
    /// Job spacing as a Duration
    pub fn job_spacing(&self) -> Duration {
        Duration::from_millis(self.job_spacing_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_spacing_ms: default_job_spacing(),
            plans: default_plans(),
        }
    }
}

fn default_job_spacing() -> u64 {
    2_000
}

fn default_daily_plan() -> Vec<String> {
    [
        "sessions",
        "attendees",
        "persons",
        "bunks",
        "bunk_plans",
        "bunk_assignments",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_plans() -> BTreeMap<String, Vec<String>> {
    let mut plans = BTreeMap::new();
    plans.insert("daily".to_string(), default_daily_plan());
    plans.insert(
        "weekly".to_string(),
        ["divisions", "custom_field_definitions", "person_custom_values"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    plans.insert("historical".to_string(), default_daily_plan());
    plans
}

/// Periodic trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Whether the scheduler runs in `serve` mode
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Delay before the first tick in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Maximum random delay added to each tick in seconds
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,

    /// Sync types to trigger and how often
    #[serde(default = "default_schedules")]
    pub schedules: Vec<ScheduleEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            initial_delay_secs: default_initial_delay(),
            jitter_secs: default_jitter_secs(),
            schedules: default_schedules(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_initial_delay() -> u64 {
    10
}

fn default_jitter_secs() -> u64 {
    30
}

fn default_schedules() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            sync_type: "daily".to_string(),
            interval_secs: 86_400,
            run_on_start: false,
        },
        ScheduleEntry {
            sync_type: "weekly".to_string(),
            interval_secs: 604_800,
            run_on_start: false,
        },
    ]
}

/// One periodic trigger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    /// Composite sync type or job name to trigger
    pub sync_type: String,

    /// Interval between triggers in seconds
    pub interval_secs: u64,

    /// Whether to trigger once right after the initial delay
    #[serde(default)]
    pub run_on_start: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/record-sync.db".to_string()
}

/// Admin HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Whether the admin server runs in `serve` mode
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,

    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_server_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty or compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Definition of one synchronized entity type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityConfig {
    /// Upstream resource path, relative to the base URL
    pub resource: String,

    /// Store collection; defaults to the entity name
    #[serde(default)]
    pub collection: Option<String>,

    /// Target fields whose values form the natural key, in order
    pub key_fields: Vec<String>,

    /// Target field name to source mapping
    pub fields: BTreeMap<String, FieldMappingConfig>,

    /// Whether passes are scoped to a year
    #[serde(default)]
    pub year_scoped: bool,

    /// What to do when one pass sees the same key twice
    #[serde(default)]
    pub duplicate_policy: DuplicateKeyPolicy,

    /// Page size override for this entity
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// Mapping of one target field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMappingConfig {
    /// JSON pointer (`/a/b`) or dotted path (`a.b`) into the upstream item
    pub source: String,

    /// How stored and incoming values are compared
    #[serde(default)]
    pub compare: FieldComparator,

    /// Whether a missing or null source value fails the item
    #[serde(default)]
    pub required: bool,

    /// Whether a change in this field triggers an update
    #[serde(default = "default_compare_enabled")]
    pub compare_enabled: bool,
}

fn default_compare_enabled() -> bool {
    true
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax; unknown variables are left as is.
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
