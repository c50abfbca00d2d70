//! Configuration for Chatdesk

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "CHATDESK_CONFIG";

/// Prefix for environment overrides, e.g. `CHATDESK__DATABASE__URL`
pub const ENV_PREFIX: &str = "CHATDESK";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Blast campaign engine configuration
    #[serde(default)]
    pub blast: BlastConfig,

    /// AI text-generation service
    #[serde(default)]
    pub ai: AiConfig,

    /// Outbound channel adapter
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run embedded migrations at startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            run_migrations: true,
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
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

/// Blast campaign engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlastConfig {
    /// Recipients claimed per generation batch
    #[serde(default = "default_generation_batch_size")]
    pub generation_batch_size: u32,

    /// Age after which an `is_generating` lease is considered abandoned
    #[serde(default = "default_generation_lease_secs")]
    pub generation_lease_secs: u64,

    /// Keep claiming batches until no pending recipients remain
    #[serde(default)]
    pub auto_continue_generation: bool,

    /// How often an idle pacer re-checks for approved recipients
    #[serde(default = "default_pacer_poll_interval_ms")]
    pub pacer_poll_interval_ms: u64,

    /// Supervisor tick (scheduled starts, pacer liveness)
    #[serde(default = "default_supervisor_tick_secs")]
    pub supervisor_tick_secs: u64,

    /// Counter reconciliation interval
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Minimum inter-send delay applied when a campaign does not set one
    #[serde(default = "default_min_interval_secs")]
    pub default_min_interval_secs: i32,

    /// Maximum inter-send delay applied when a campaign does not set one
    #[serde(default = "default_max_interval_secs")]
    pub default_max_interval_secs: i32,
}

impl Default for BlastConfig {
    fn default() -> Self {
        Self {
            generation_batch_size: default_generation_batch_size(),
            generation_lease_secs: default_generation_lease_secs(),
            auto_continue_generation: false,
            pacer_poll_interval_ms: default_pacer_poll_interval_ms(),
            supervisor_tick_secs: default_supervisor_tick_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            default_min_interval_secs: default_min_interval_secs(),
            default_max_interval_secs: default_max_interval_secs(),
        }
    }
}

fn default_generation_batch_size() -> u32 {
    5
}

fn default_generation_lease_secs() -> u64 {
    600
}

fn default_pacer_poll_interval_ms() -> u64 {
    2000
}

fn default_supervisor_tick_secs() -> u64 {
    5
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_min_interval_secs() -> i32 {
    30
}

fn default_max_interval_secs() -> i32 {
    90
}

/// AI text-generation service (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,

    /// Bearer token
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_ai_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,

    /// Sampling temperature
    #[serde(default = "default_ai_temperature")]
    pub temperature: f32,

    /// System prompt prepended to every generation request
    pub system_prompt: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ai_endpoint(),
            api_key: None,
            model: default_ai_model(),
            timeout_secs: default_ai_timeout(),
            temperature: default_ai_temperature(),
            system_prompt: None,
        }
    }
}

fn default_ai_endpoint() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_ai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_timeout() -> u64 {
    30
}

fn default_ai_temperature() -> f32 {
    0.7
}

/// Outbound channel adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Send endpoint of the channel gateway
    #[serde(default = "default_channel_endpoint")]
    pub endpoint: String,

    /// Bearer token
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_channel_timeout")]
    pub timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_channel_endpoint(),
            api_key: None,
            timeout_secs: default_channel_timeout(),
        }
    }
}

fn default_channel_endpoint() -> String {
    "http://localhost:3000/messages".to_string()
}

fn default_channel_timeout() -> u64 {
    15
}

impl Config {
    /// Load configuration from a single TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first file found, then environment overrides
    pub fn load() -> crate::Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let candidates = [
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/chatdesk/config.toml"),
        ];

        let path = explicit.or_else(|| candidates.into_iter().find(|p| p.exists()));
        Self::load_layered(path.as_deref())
    }

    /// Build configuration from an optional file plus `CHATDESK__*` variables
    pub fn load_layered(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf())
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let blast = &self.blast;
        if blast.generation_batch_size == 0 {
            return Err(crate::Error::Config(
                "blast.generation_batch_size must be at least 1".to_string(),
            ));
        }
        if blast.default_min_interval_secs < 0
            || blast.default_min_interval_secs > blast.default_max_interval_secs
        {
            return Err(crate::Error::Config(
                "blast default intervals must satisfy 0 <= min <= max".to_string(),
            ));
        }
        match self.database.backend.as_str() {
            "postgres" | "memory" => Ok(()),
            other => Err(crate::Error::Config(format!(
                "Unsupported database backend: {}",
                other
            ))),
        }
    }
}
