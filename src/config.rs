//! # Configuration Management Module
//!
//! ## Purpose
//! Centralized configuration for the citation core, loaded from a TOML file
//! with environment-variable overrides and validated at startup.
//!
//! ## Configuration Sources (in order of precedence)
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML)
//! 3. Default values (lowest priority)
//!
//! Configuration is an immutable value injected at construction; a "reload"
//! is a reconstruction of the service graph with a fresh `Config`. Feature
//! flags gate strictly additive behavior, so a misconfigured flag degrades to
//! baseline behavior rather than failing requests.
//!
//! ## Usage
//! ```rust,no_run
//! use grounded_cite::Config;
//!
//! let config = Config::load("config.toml").unwrap();
//! println!("Server port: {}", config.server.port);
//! ```

use crate::errors::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure containing all system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server and API configuration
    pub server: ServerConfig,
    /// Corpus storage settings
    pub storage: StorageConfig,
    /// Retrieval engine behavior
    pub retrieval: RetrievalConfig,
    /// Recall augmentation (phase 1) settings
    pub augment: AugmentConfig,
    /// Grounded generation / model settings
    pub generation: GenerationConfig,
    /// Audit recording and retention
    pub audit: AuditConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server and API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub host: String,
    /// Server port
    pub port: u16,
    /// API key required in `X-API-Key` for protected endpoints (None = open)
    pub external_api_key: Option<String>,
    /// External rate limit, sustained tokens per second
    pub rate_limit_per_second: f64,
    /// External rate limit burst size
    pub rate_limit_burst: f64,
    /// Maximum accepted question length in characters
    pub max_question_chars: usize,
    /// Enable CORS
    pub enable_cors: bool,
    /// Directory holding fetched opinion PDFs for `/pdf/{id}`
    pub pdf_dir: PathBuf,
}

/// Corpus storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Sled database path
    pub db_path: PathBuf,
    /// Gzip-compress stored page text
    pub enable_compression: bool,
    /// Corpus version cache TTL in seconds
    pub version_cache_ttl_seconds: u64,
}

/// Retrieval engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default result limit for chunk/page search
    pub default_limit: usize,
    /// Page text cap at the retrieval boundary (prevents prompt bloat)
    pub max_text_chars: usize,
    /// Pages handed to the generator as context
    pub context_pages: usize,
    /// Shared deadline for retrieval plus the web-search collaborator, seconds
    pub retrieval_deadline_seconds: u64,
}

/// Recall augmentation configuration. All feature flags default to off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Enable query decomposition for multi-issue queries
    pub query_decompose_enabled: bool,
    /// Enable semantic nearest-neighbor fallback
    pub embed_recall_enabled: bool,
    /// Total augmentation latency budget in milliseconds
    pub budget_ms: u64,
    /// Trigger: baseline result count below this
    pub min_fts_results: usize,
    /// Trigger: top baseline score below this
    pub min_top_score: f32,
    /// Maximum focused subqueries per decomposition
    pub max_subqueries: usize,
    /// Cap on candidates added by augmentation
    pub max_augment_candidates: usize,
    /// Cap on semantic-fallback candidates
    pub max_embed_candidates: usize,
    /// Strong-baseline suppression: minimum source count
    pub strong_baseline_min_sources: usize,
    /// Strong-baseline suppression: minimum top score
    pub strong_baseline_min_score: f32,
    /// Force augmentation regardless of triggers (eval harness only)
    pub eval_force_phase1: bool,
}

/// Grounded generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// OpenAI-compatible endpoint base URL (None = model unavailable,
    /// retrieval-only fallback)
    pub openai_base_url: Option<String>,
    /// API key for the model endpoint
    pub openai_api_key: Option<String>,
    /// Pinned model identifier
    pub chat_model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token cap
    pub max_tokens: u32,
    /// Per-request timeout in seconds (hard cancellation)
    pub request_timeout_seconds: u64,
    /// Outer deadline for the scheduled call in seconds
    pub outer_timeout_seconds: u64,
    /// Bounded worker pool size for concurrent model calls
    pub worker_pool_size: usize,
    /// Embeddings provider toggle for the semantic fallback
    pub embeddings_enabled: bool,
    /// Embedding model identifier
    pub embedding_model: String,
}

/// Audit recording and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Consecutive failures that open the circuit breaker
    pub breaker_failure_threshold: u32,
    /// Breaker cooldown before a half-open probe, seconds
    pub breaker_cooldown_seconds: u64,
    /// Days after which final answers are redacted
    pub retention_redact_days: i64,
    /// Days after which query runs are deleted
    pub retention_delete_days: i64,
    /// Replay packet size cap in bytes
    pub replay_packet_max_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG)
    pub level: String,
    /// Emit JSON-formatted logs
    pub json_format: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            external_api_key: None,
            rate_limit_per_second: 5.0,
            rate_limit_burst: 10.0,
            max_question_chars: 2000,
            enable_cors: true,
            pdf_dir: PathBuf::from("./data/pdfs"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/grounded_cite.db"),
            enable_compression: true,
            version_cache_ttl_seconds: 300,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_text_chars: 2000,
            context_pages: 15,
            retrieval_deadline_seconds: 15,
        }
    }
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            query_decompose_enabled: false,
            embed_recall_enabled: false,
            budget_ms: 500,
            min_fts_results: 8,
            min_top_score: 0.15,
            max_subqueries: 4,
            max_augment_candidates: 50,
            max_embed_candidates: 30,
            strong_baseline_min_sources: 5,
            strong_baseline_min_score: 0.5,
            eval_force_phase1: false,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            openai_base_url: None,
            openai_api_key: None,
            chat_model: "gpt-4o".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            request_timeout_seconds: 60,
            outer_timeout_seconds: 90,
            worker_pool_size: 4,
            embeddings_enabled: false,
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 5,
            breaker_cooldown_seconds: 300,
            retention_redact_days: 90,
            retention_delete_days: 365,
            replay_packet_max_bytes: 1_000_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            retrieval: RetrievalConfig::default(),
            augment: AugmentConfig::default(),
            generation: GenerationConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file (if it exists), apply environment
    /// overrides, and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply recognized environment variables on top of the file values
    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        // Service bindings
        if let Ok(port) = env::var("GROUNDED_CITE_PORT") {
            self.server.port = port.parse().map_err(|_| CoreError::Config {
                message: "Invalid port number in GROUNDED_CITE_PORT".to_string(),
            })?;
        }
        if let Ok(db_path) = env::var("GROUNDED_CITE_DB_PATH") {
            self.storage.db_path = PathBuf::from(db_path);
        }
        if let Ok(key) = env::var("EXTERNAL_API_KEY") {
            self.server.external_api_key = Some(key);
        }

        // Model endpoint
        if let Ok(url) = env::var("AI_INTEGRATIONS_OPENAI_BASE_URL") {
            self.generation.openai_base_url = Some(url);
        }
        if let Ok(key) = env::var("AI_INTEGRATIONS_OPENAI_API_KEY") {
            self.generation.openai_api_key = Some(key);
        }
        if let Ok(model) = env::var("CHAT_MODEL") {
            self.generation.chat_model = model;
        }
        if let Ok(flag) = env::var("VOYAGER_EMBEDDINGS_ENABLED") {
            self.generation.embeddings_enabled = parse_bool(&flag);
        }

        // Augmentation
        if let Ok(flag) = env::var("SMART_QUERY_DECOMPOSE_ENABLED") {
            self.augment.query_decompose_enabled = parse_bool(&flag);
        }
        if let Ok(flag) = env::var("SMART_EMBED_RECALL_ENABLED") {
            self.augment.embed_recall_enabled = parse_bool(&flag);
        }
        if let Ok(flag) = env::var("EVAL_FORCE_PHASE1") {
            self.augment.eval_force_phase1 = parse_bool(&flag);
        }
        self.augment.budget_ms = env_parse("PHASE1_BUDGET_MS", self.augment.budget_ms)?;
        self.augment.min_fts_results = env_parse("MIN_FTS_RESULTS", self.augment.min_fts_results)?;
        self.augment.min_top_score = env_parse("MIN_TOP_SCORE", self.augment.min_top_score)?;
        self.augment.max_subqueries = env_parse("MAX_SUBQUERIES", self.augment.max_subqueries)?;
        self.augment.max_augment_candidates =
            env_parse("MAX_AUGMENT_CANDIDATES", self.augment.max_augment_candidates)?;
        self.augment.max_embed_candidates =
            env_parse("MAX_EMBED_CANDIDATES", self.augment.max_embed_candidates)?;
        self.augment.strong_baseline_min_sources = env_parse(
            "STRONG_BASELINE_MIN_SOURCES",
            self.augment.strong_baseline_min_sources,
        )?;
        self.augment.strong_baseline_min_score = env_parse(
            "STRONG_BASELINE_MIN_SCORE",
            self.augment.strong_baseline_min_score,
        )?;

        // Retention
        self.audit.retention_redact_days =
            env_parse("RETENTION_REDACT_DAYS", self.audit.retention_redact_days)?;
        self.audit.retention_delete_days =
            env_parse("RETENTION_DELETE_DAYS", self.audit.retention_delete_days)?;

        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(CoreError::ValidationFailed {
                field: "server.port".to_string(),
                reason: "Port cannot be zero".to_string(),
            });
        }
        if self.server.max_question_chars == 0 {
            return Err(CoreError::ValidationFailed {
                field: "server.max_question_chars".to_string(),
                reason: "Question length cap must be positive".to_string(),
            });
        }
        if self.generation.worker_pool_size == 0 {
            return Err(CoreError::ValidationFailed {
                field: "generation.worker_pool_size".to_string(),
                reason: "Worker pool must have at least one slot".to_string(),
            });
        }
        if self.generation.outer_timeout_seconds < self.generation.request_timeout_seconds {
            return Err(CoreError::ValidationFailed {
                field: "generation.outer_timeout_seconds".to_string(),
                reason: "Outer deadline cannot be shorter than the request timeout".to_string(),
            });
        }
        if self.audit.retention_delete_days < self.audit.retention_redact_days {
            return Err(CoreError::ValidationFailed {
                field: "audit.retention_delete_days".to_string(),
                reason: "Deletion horizon cannot precede the redaction horizon".to_string(),
            });
        }
        if self.augment.min_top_score < 0.0 {
            return Err(CoreError::ValidationFailed {
                field: "augment.min_top_score".to_string(),
                reason: "Score threshold cannot be negative".to_string(),
            });
        }
        Ok(())
    }

    /// Get configuration as TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config {
            message: format!("Failed to serialize config to TOML: {}", e),
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| CoreError::Config {
            message: format!("Invalid value for {}: {}", name, raw),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.augment.budget_ms, 500);
        assert_eq!(config.augment.min_fts_results, 8);
        assert_eq!(config.generation.chat_model, "gpt-4o");
        assert_eq!(config.audit.retention_redact_days, 90);
        assert_eq!(config.audit.retention_delete_days, 365);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.augment.max_subqueries, config.augment.max_subqueries);
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        let mut config = Config::default();
        config.generation.outer_timeout_seconds = 10;
        config.generation.request_timeout_seconds = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("nope"));
    }
}
