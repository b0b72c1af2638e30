//! Configuration for the platform services
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/soorma/config.toml, or $SOORMA_CONFIG)
//! 3. Built-in defaults (lowest priority)
//!
//! Each service reads its own section; the env var names form a closed set
//! (ADAPTER, NATS_URL, PORT, STREAM_MAX_QUEUE_SIZE,
//! STREAM_HEARTBEAT_INTERVAL_S, DATABASE_URL, AGENT_TTL_SECONDS,
//! AGENT_CLEANUP_INTERVAL_SECONDS, CORS_ORIGINS, IS_PROD,
//! EMBEDDING_MODEL_DIM). `PORT` and `DATABASE_URL` apply to whichever
//! service the current process runs.

use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

#[cfg(test)]
mod tests;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Adapter selection
// ─────────────────────────────────────────────────────────────────────────────

/// Bus backend for the Event Service. Closed set; picked at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Memory,
    Nats,
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(AdapterKind::Memory),
            "nats" => Ok(AdapterKind::Nats),
            other => Err(format!(
                "unknown adapter {:?} (expected \"memory\" or \"nats\")",
                other
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-service configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Event Service (gateway) settings.
#[derive(Debug, Clone)]
pub struct EventServiceConfig {
    pub adapter: AdapterKind,
    pub nats_url: String,
    pub port: u16,
    /// Per-connection bounded queue capacity (drop-oldest on overflow)
    pub stream_max_queue_size: usize,
    /// Idle interval before an SSE heartbeat frame is emitted
    pub stream_heartbeat_interval_s: u64,
    pub is_prod: bool,
}

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::Memory,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            port: 8081,
            stream_max_queue_size: 1024,
            stream_heartbeat_interval_s: 30,
            is_prod: false,
        }
    }
}

/// Registry Service settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// SQLite database path
    pub database_url: String,
    pub port: u16,
    /// An agent is active iff now - last_heartbeat <= TTL
    pub agent_ttl_seconds: u64,
    /// Reaper wake interval
    pub agent_cleanup_interval_seconds: u64,
    pub cors_origins: Vec<String>,
    pub is_prod: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_url: "./registry.db".to_string(),
            port: 8082,
            agent_ttl_seconds: 300,
            agent_cleanup_interval_seconds: 60,
            cors_origins: vec!["*".to_string()],
            is_prod: false,
        }
    }
}

/// Memory Service settings.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// SQLite database path
    pub database_url: String,
    pub port: u16,
    /// Dimension of the embedding vectors the injected provider produces
    pub embedding_model_dim: usize,
    pub is_prod: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_url: "./memory.db".to_string(),
            port: 8083,
            embedding_model_dim: 384,
            is_prod: false,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub event_service: EventServiceConfig,
    pub registry: RegistryConfig,
    pub memory: MemoryConfig,
    /// Default tracing filter level when RUST_LOG is unset
    pub log_level: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// File configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub log_level: Option<String>,
    pub event_service: Option<FileEventService>,
    pub registry: Option<FileRegistry>,
    pub memory: Option<FileMemory>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileEventService {
    pub adapter: Option<AdapterKind>,
    pub nats_url: Option<String>,
    pub port: Option<u16>,
    pub stream_max_queue_size: Option<usize>,
    pub stream_heartbeat_interval_s: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileRegistry {
    pub database_url: Option<String>,
    pub port: Option<u16>,
    pub agent_ttl_seconds: Option<u64>,
    pub agent_cleanup_interval_seconds: Option<u64>,
    pub cors_origins: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileMemory {
    pub database_url: Option<String>,
    pub port: Option<u16>,
    pub embedding_model_dim: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env_var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// SQLite path from a DATABASE_URL-style value: a bare path is used as-is,
/// a `sqlite://` scheme is stripped.
fn database_path(value: &str) -> String {
    value
        .strip_prefix("sqlite://")
        .unwrap_or(value)
        .to_string()
}

impl Config {
    /// Get the config file path: $SOORMA_CONFIG or ~/.config/soorma/config.toml
    pub fn config_path() -> Option<PathBuf> {
        if let Some(explicit) = env_var("SOORMA_CONFIG") {
            return Some(PathBuf::from(explicit));
        }
        dirs::home_dir().map(|p| p.join(".config").join("soorma").join("config.toml"))
    }

    /// Load file config if it exists.
    ///
    /// A config file that exists but cannot be parsed is a fatal error -
    /// failing fast beats silently serving with defaults while the operator
    /// debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config file {}: {}", path.display(), e);
                    eprintln!("Fix or delete the file and restart.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env > file > defaults.
    pub fn from_env() -> Self {
        Self::from_file_config(Self::load_file_config())
    }

    pub(crate) fn from_file_config(file: FileConfig) -> Self {
        let defaults = Config::default();
        let is_prod = env_bool("IS_PROD").unwrap_or(false);

        let fe = file.event_service.unwrap_or_default();
        let event_service = EventServiceConfig {
            adapter: env_parse("ADAPTER")
                .or(fe.adapter)
                .unwrap_or(defaults.event_service.adapter),
            nats_url: env_var("NATS_URL")
                .or(fe.nats_url)
                .unwrap_or(defaults.event_service.nats_url),
            port: env_parse("PORT")
                .or(fe.port)
                .unwrap_or(defaults.event_service.port),
            stream_max_queue_size: env_parse("STREAM_MAX_QUEUE_SIZE")
                .or(fe.stream_max_queue_size)
                .unwrap_or(defaults.event_service.stream_max_queue_size),
            stream_heartbeat_interval_s: env_parse("STREAM_HEARTBEAT_INTERVAL_S")
                .or(fe.stream_heartbeat_interval_s)
                .unwrap_or(defaults.event_service.stream_heartbeat_interval_s),
            is_prod,
        };

        let fr = file.registry.unwrap_or_default();
        let registry = RegistryConfig {
            database_url: env_var("DATABASE_URL")
                .map(|v| database_path(&v))
                .or(fr.database_url)
                .unwrap_or(defaults.registry.database_url),
            port: env_parse("PORT")
                .or(fr.port)
                .unwrap_or(defaults.registry.port),
            agent_ttl_seconds: env_parse("AGENT_TTL_SECONDS")
                .or(fr.agent_ttl_seconds)
                .unwrap_or(defaults.registry.agent_ttl_seconds),
            agent_cleanup_interval_seconds: env_parse("AGENT_CLEANUP_INTERVAL_SECONDS")
                .or(fr.agent_cleanup_interval_seconds)
                .unwrap_or(defaults.registry.agent_cleanup_interval_seconds),
            cors_origins: env_var("CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .or(fr.cors_origins)
                .unwrap_or(defaults.registry.cors_origins),
            is_prod,
        };

        let fm = file.memory.unwrap_or_default();
        let memory = MemoryConfig {
            database_url: env_var("DATABASE_URL")
                .map(|v| database_path(&v))
                .or(fm.database_url)
                .unwrap_or(defaults.memory.database_url),
            port: env_parse("PORT")
                .or(fm.port)
                .unwrap_or(defaults.memory.port),
            embedding_model_dim: env_parse("EMBEDDING_MODEL_DIM")
                .or(fm.embedding_model_dim)
                .unwrap_or(defaults.memory.embedding_model_dim),
            is_prod,
        };

        Self {
            event_service,
            registry,
            memory,
            log_level: env_var("SOORMA_LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_service: EventServiceConfig::default(),
            registry: RegistryConfig::default(),
            memory: MemoryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}
