//! Configuration file and environment handling
//!
//! Settings live in `~/.config/kopikita-agent/config.toml`. Every key has a
//! default, so a missing file or a partial file is fine. Secrets and
//! endpoints can be supplied through the environment instead, and the
//! environment wins over the file.
use crate::password_sanitizer::{mask_api_key, sanitize_connection_url};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_AI_API_KEY: &str = "AI_API_KEY";
pub const ENV_AI_BASE_URL: &str = "AI_BASE_URL";
pub const ENV_AI_MODEL: &str = "AI_MODEL";

pub const DEFAULT_SCHEMA_TABLES: &[&str] = &[
    "Customer",
    "Tag",
    "Product",
    "Sale",
    "CustomerTag",
    "PromoIdeaTag",
    "PromoIdeaProduct",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub console_output: bool,
    pub file_output: bool,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            console_output: true,
            file_output: false,
            file_path: default_log_file_path(),
        }
    }
}

fn default_log_file_path() -> String {
    match Config::config_dir() {
        Some(dir) => dir.join("agent.log").to_string_lossy().to_string(),
        None => "agent.log".to_string(),
    }
}

/// Language model endpoint
#[derive(Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    /// API key (or AI_API_KEY)
    pub api_key: Option<String>,
    /// OpenAI-compatible base URL (or AI_BASE_URL)
    pub base_url: String,
    /// Model name (or AI_MODEL)
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_seconds: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 2048,
            request_timeout_seconds: 60,
        }
    }
}

impl AiConfig {
    /// API key if one is configured and not blank
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiConfig")
            .field("api_key", &self.api_key.as_deref().map(mask_api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SchemaConfig {
    /// Tables described to the chat and promo agents
    pub include_tables: Vec<String>,
    /// Sample rows shown per table
    pub sample_rows: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            include_tables: DEFAULT_SCHEMA_TABLES.iter().map(|t| t.to_string()).collect(),
            sample_rows: 2,
        }
    }
}

fn timeout_from_seconds(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub row_limit: usize,
    pub max_steps: usize,
    /// 0 disables the timeout
    pub timeout_seconds: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            row_limit: 5,
            max_steps: 8,
            timeout_seconds: 45,
        }
    }
}

impl ChatConfig {
    pub fn timeout(&self) -> Option<Duration> {
        timeout_from_seconds(self.timeout_seconds)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PromoConfig {
    pub row_limit: usize,
    pub max_steps: usize,
    pub timeout_seconds: u64,
}

impl Default for PromoConfig {
    fn default() -> Self {
        Self {
            row_limit: 20,
            max_steps: 16,
            timeout_seconds: 90,
        }
    }
}

impl PromoConfig {
    pub fn timeout(&self) -> Option<Duration> {
        timeout_from_seconds(self.timeout_seconds)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SeedConfig {
    pub max_steps: usize,
    pub timeout_seconds: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            max_steps: 120,
            timeout_seconds: 0,
        }
    }
}

impl SeedConfig {
    pub fn timeout(&self) -> Option<Duration> {
        timeout_from_seconds(self.timeout_seconds)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub query_timeout_seconds: u64,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            query_timeout_seconds: 30,
            max_connections: 8,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// PostgreSQL connection URL (or DATABASE_URL)
    pub database_url: Option<String>,
    pub ai: AiConfig,
    pub schema: SchemaConfig,
    pub chat: ChatConfig,
    pub promo: PromoConfig,
    pub seed: SeedConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "database_url",
                &self.database_url.as_deref().map(sanitize_connection_url),
            )
            .field("ai", &self.ai)
            .field("schema", &self.schema)
            .field("chat", &self.chat)
            .field("promo", &self.promo)
            .field("seed", &self.seed)
            .field("database", &self.database)
            .field("logging", &self.logging)
            .finish()
    }
}

impl Config {
    /// `~/.config/kopikita-agent`
    pub fn config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".config").join("kopikita-agent"))
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load configuration, apply environment overrides and validate.
    ///
    /// An explicit `path` must exist; the default location may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Config::default()
                }
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup; blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
        if let Some(key) = get(ENV_AI_API_KEY) {
            self.ai.api_key = Some(key);
        }
        if let Some(base_url) = get(ENV_AI_BASE_URL) {
            self.ai.base_url = base_url;
        }
        if let Some(model) = get(ENV_AI_MODEL) {
            self.ai.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return invalid("ai.temperature must be between 0.0 and 2.0");
        }
        if self.ai.max_tokens == 0 {
            return invalid("ai.max_tokens must be greater than 0");
        }
        if self.ai.request_timeout_seconds == 0 {
            return invalid("ai.request_timeout_seconds must be greater than 0");
        }
        if self.ai.base_url.trim().is_empty() {
            return invalid("ai.base_url must not be empty");
        }
        if self.ai.model.trim().is_empty() {
            return invalid("ai.model must not be empty");
        }
        if self.chat.row_limit == 0 || self.promo.row_limit == 0 {
            return invalid("row_limit must be greater than 0");
        }
        if self.chat.max_steps == 0 || self.promo.max_steps == 0 || self.seed.max_steps == 0 {
            return invalid("max_steps must be greater than 0");
        }
        if self.database.query_timeout_seconds == 0 {
            return invalid("database.query_timeout_seconds must be greater than 0");
        }
        if self.database.max_connections == 0 {
            return invalid("database.max_connections must be greater than 0");
        }
        Ok(())
    }

    /// Get documentation for configuration fields
    pub fn documentation() -> Vec<(&'static str, &'static str)> {
        vec![
            ("database_url", "PostgreSQL connection URL (or DATABASE_URL env var)"),
            ("", ""),
            ("[ai]", "OpenAI-compatible chat completions endpoint"),
            ("api_key", "API key (or AI_API_KEY env var)"),
            ("base_url", "Base URL (default: https://api.openai.com/v1, or AI_BASE_URL)"),
            ("model", "Model name (default: gpt-4o-mini, or AI_MODEL)"),
            ("temperature", "Sampling temperature 0.0-2.0 (default: 0.0)"),
            ("max_tokens", "Maximum tokens per completion (default: 2048)"),
            ("request_timeout_seconds", "HTTP timeout per model call (default: 60)"),
            ("", ""),
            ("[schema]", "Schema text given to the chat and promo agents"),
            ("include_tables", "Tables to describe (default: Customer, Tag, Product, Sale, CustomerTag, PromoIdeaTag, PromoIdeaProduct)"),
            ("sample_rows", "Sample rows per table (default: 2)"),
            ("", ""),
            ("[chat]", "Chat assistant bounds"),
            ("row_limit", "Rows per query (default: 5)"),
            ("max_steps", "Model calls per answer (default: 8)"),
            ("timeout_seconds", "Wall-clock limit, 0 = none (default: 45)"),
            ("", ""),
            ("[promo]", "Promo idea generator bounds"),
            ("row_limit", "Rows per query (default: 20)"),
            ("max_steps", "Model calls per generation (default: 16)"),
            ("timeout_seconds", "Wall-clock limit, 0 = none (default: 90)"),
            ("", ""),
            ("[seed]", "Dummy data seeder bounds"),
            ("max_steps", "Model calls per run (default: 120)"),
            ("timeout_seconds", "Wall-clock limit, 0 = none (default: 0)"),
            ("", ""),
            ("[database]", "Connection pool"),
            ("query_timeout_seconds", "Per-statement timeout (default: 30)"),
            ("max_connections", "Pool size (default: 8)"),
            ("", ""),
            ("[logging]", "Diagnostics on stderr and optional log file"),
            ("level", "trace, debug, info, warn, error (default: info; RUST_LOG overrides)"),
            ("console_output", "Log to stderr (default: true)"),
            ("file_output", "Also log to file_path (default: false)"),
            ("file_path", "Log file (default: ~/.config/kopikita-agent/agent.log)"),
        ]
    }
}
