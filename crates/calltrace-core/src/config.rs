//! Configuration system for the tracer
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Sink configuration schema

use crate::endpoints::default_endpoints;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "CALLTRACE_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub tracer: TracerSettings,

    /// Telemetry endpoints that bypass instrumentation (name -> URL fragment)
    pub endpoints: BTreeMap<String, String>,

    pub session: SessionSettings,

    pub collector: CollectorSettings,

    pub jsonl: JsonlSettings,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            tracer: TracerSettings::default(),
            endpoints: default_endpoints(),
            session: SessionSettings::default(),
            collector: CollectorSettings::default(),
            jsonl: JsonlSettings::default(),
        }
    }
}

/// Core tracer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerSettings {
    pub log_level: String,

    /// Sent as `X-User-Agent` on every instrumented call
    pub user_agent: String,

    pub serializer_max_depth: usize,

    /// When false, calls pass straight through to the transport
    pub enabled: bool,
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            user_agent: format!("calltrace/{}", crate::VERSION),
            serializer_max_depth: crate::serialize::DEFAULT_MAX_DEPTH,
            enabled: true,
        }
    }
}

/// Where the session id is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Memory,
    #[default]
    File,
    None,
}

impl std::str::FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageMode::Memory),
            "file" => Ok(StorageMode::File),
            "none" => Ok(StorageMode::None),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid session storage: {}. Must be one of: memory, file, none",
                other
            ))),
        }
    }
}

/// Session persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub storage: StorageMode,

    /// File used when `storage = "file"`; defaults to the user config dir
    pub path: Option<String>,
}

/// Remote collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub enabled: bool,

    pub url: String,

    /// Maximum events per POST
    pub batch_size: usize,

    /// Maximum time an event waits in a partial batch
    pub flush_interval_ms: u64,

    pub max_retries: u32,

    pub timeout_secs: u64,

    /// Events buffered before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            batch_size: 50,
            flush_interval_ms: 1000,
            max_retries: 3,
            timeout_secs: 10,
            queue_capacity: 10_000,
        }
    }
}

/// JSONL file sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlSettings {
    pub enabled: bool,

    pub path: String,

    pub append: bool,

    /// Flush after every event
    pub flush_each: bool,
}

impl Default for JsonlSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "calltrace-events.jsonl".to_string(),
            append: true,
            flush_each: true,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. CALLTRACE_CONFIG environment variable
    /// 3. ~/.config/calltrace/config.toml
    /// 4. /etc/calltrace/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<TracerConfig> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Load with `var` standing in for the process environment
    fn load_with_env(&self, var: impl Fn(&str) -> Option<String>) -> ConfigResult<TracerConfig> {
        let mut config = match self.find_config_file(&var) {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                TracerConfig::default()
            }
        };

        apply_overrides(&mut config, &var);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self, var: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Some(env_path) = var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("{} path does not exist: {}", CONFIG_ENV_VAR, env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/calltrace/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<TracerConfig> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: TracerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self, config: &TracerConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.tracer.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.tracer.log_level, valid_levels
            )));
        }

        if config.tracer.serializer_max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "Serializer max depth cannot be 0".to_string(),
            ));
        }

        if config.collector.enabled {
            let url = url::Url::parse(&config.collector.url).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Invalid collector URL '{}': {}",
                    config.collector.url, e
                ))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::ValidationError(format!(
                    "Collector URL must be http or https: {}",
                    config.collector.url
                )));
            }
            if config.collector.batch_size == 0 {
                return Err(ConfigError::ValidationError(
                    "Collector batch size cannot be 0".to_string(),
                ));
            }
            if config.collector.queue_capacity == 0 {
                return Err(ConfigError::ValidationError(
                    "Collector queue capacity cannot be 0".to_string(),
                ));
            }
        }

        if config.jsonl.enabled && config.jsonl.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "JSONL sink enabled without a path".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &TracerConfig, path: &Path) -> ConfigResult<()> {
        let content = to_toml(config)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("calltrace").join("config.toml"))
    }

    /// The user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a configuration as TOML
pub fn to_toml(config: &TracerConfig) -> ConfigResult<String> {
    toml::to_string_pretty(config)
        .map_err(|e| ConfigError::ValidationError(format!("Failed to serialize config: {}", e)))
}

fn apply_overrides(config: &mut TracerConfig, var: impl Fn(&str) -> Option<String>) {
    // Tracer settings
    if let Some(val) = var("CALLTRACE_LOG_LEVEL") {
        config.tracer.log_level = val;
    }
    if let Some(val) = var("CALLTRACE_USER_AGENT") {
        config.tracer.user_agent = val;
    }
    if let Some(val) = var("CALLTRACE_MAX_DEPTH") {
        if let Ok(depth) = val.parse() {
            config.tracer.serializer_max_depth = depth;
        }
    }
    if let Some(val) = var("CALLTRACE_ENABLED") {
        config.tracer.enabled = val.parse().unwrap_or(config.tracer.enabled);
    }

    // Session settings
    if let Some(val) = var("CALLTRACE_SESSION_STORAGE") {
        match val.parse() {
            Ok(mode) => config.session.storage = mode,
            Err(e) => warn!("Ignoring CALLTRACE_SESSION_STORAGE: {}", e),
        }
    }
    if let Some(val) = var("CALLTRACE_SESSION_PATH") {
        config.session.path = Some(val);
    }

    // Collector settings
    if let Some(val) = var("CALLTRACE_COLLECTOR_URL") {
        config.collector.url = val;
        config.collector.enabled = true;
    }
    if let Some(val) = var("CALLTRACE_COLLECTOR_ENABLED") {
        config.collector.enabled = val.parse().unwrap_or(config.collector.enabled);
    }

    // JSONL settings
    if let Some(val) = var("CALLTRACE_JSONL_PATH") {
        config.jsonl.path = val;
        config.jsonl.enabled = true;
    }
    if let Some(val) = var("CALLTRACE_JSONL_ENABLED") {
        config.jsonl.enabled = val.parse().unwrap_or(config.jsonl.enabled);
    }
}
