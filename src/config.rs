use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub monitor: MonitorConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Accepted bearer keys. Empty list disables auth (local development).
    pub api_keys: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub cache_dir: String,
    pub cache_size: u64,
    pub cache_ttl_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub min_similarity: f64,
    /// Default search window in days. 0 disables the age filter.
    pub max_age_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub user_id: String,
    pub capture_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub diff_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub max_days: i64,
    pub purge_days: i64,
    pub check_interval_hours: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            monitor: MonitorConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3001,
            api_keys: Vec::new(),
            allowed_origins: Vec::new(),
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_data_dir()
            .join("user_memory.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_data_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            cache_size: 1000,
            cache_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.3,
            max_age_days: 30,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_id: "default_user".into(),
            capture_interval_ms: 10_000,
            idle_timeout_ms: 300_000,
            diff_threshold: 0.15,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_days: 1825,
            purge_days: 365,
            check_interval_hours: 24,
        }
    }
}

/// Returns `~/.thinkdrop/`
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".thinkdrop")
}

/// Returns the default config file path: `~/.thinkdrop/config.toml`
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Returns the skill sandbox directory: `~/.thinkdrop/skills/`
pub fn skill_sandbox_dir() -> PathBuf {
    default_data_dir().join("skills")
}

impl ServiceConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            ServiceConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HOST") {
            self.server.host = val;
        }
        if let Some(val) = env_parse::<u16>("PORT") {
            self.server.port = val;
        }
        if let Ok(val) = std::env::var("API_KEY") {
            self.server.api_keys = split_csv(&val);
        }
        if let Ok(val) = std::env::var("ALLOWED_ORIGINS") {
            self.server.allowed_origins = split_csv(&val);
        }
        if let Ok(val) = std::env::var("LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("DB_PATH") {
            self.storage.db_path = val;
        }
        if let Some(val) = env_parse::<u64>("EMBEDDING_CACHE_SIZE") {
            self.embedding.cache_size = val;
        }
        if let Some(val) = env_parse::<u64>("EMBEDDING_CACHE_TTL") {
            self.embedding.cache_ttl_ms = val;
        }
        if let Some(val) = env_parse::<f64>("MIN_SIMILARITY_THRESHOLD") {
            self.search.min_similarity = val;
        }
        if let Some(val) = env_parse::<i64>("MAX_AGE_DAYS") {
            self.search.max_age_days = val;
        }
        if let Some(val) = env_parse::<bool>("MONITOR_SCREEN_OCR") {
            self.monitor.enabled = val;
        }
        if let Ok(val) = std::env::var("MONITOR_USER_ID") {
            self.monitor.user_id = val;
        }
        if let Some(val) = env_parse::<u64>("SCREEN_CAPTURE_INTERVAL") {
            self.monitor.capture_interval_ms = val;
        }
        if let Some(val) = env_parse::<u64>("SCREEN_CAPTURE_IDLE_TIMEOUT") {
            self.monitor.idle_timeout_ms = val;
        }
        if let Some(val) = env_parse::<f64>("SCREEN_CAPTURE_DIFF_THRESHOLD") {
            self.monitor.diff_threshold = val;
        }
        if let Some(val) = env_parse::<bool>("RETENTION_ENABLED") {
            self.retention.enabled = val;
        }
        if let Some(val) = env_parse::<i64>("RETENTION_MAX_DAYS") {
            self.retention.max_days = val;
        }
        if let Some(val) = env_parse::<i64>("RETENTION_PURGE_DAYS") {
            self.retention.purge_days = val;
        }
        if let Some(val) = env_parse::<u64>("RETENTION_CHECK_INTERVAL_HOURS") {
            self.retention.check_interval_hours = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
