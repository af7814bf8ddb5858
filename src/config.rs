//! Configuration for the knowledge substrate
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `KNOWLEDGE__SECTION__FIELD` environment variables (a `.env` file is
//! honoured).

use crate::error::{KnowledgeError, Result};
use crate::query::RankingPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_NAME: &str = "knowledge";
const ENV_PREFIX: &str = "KNOWLEDGE";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub truth: TruthConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub working_memory: WorkingMemoryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Truth maintenance and ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthConfig {
    /// Minimum credibility margin for automatic contradiction resolution
    #[serde(default = "default_margin")]
    pub auto_resolve_margin: f64,

    #[serde(default = "default_reliability_weight")]
    pub reliability_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    #[serde(default = "default_corroboration_weight")]
    pub corroboration_weight: f64,

    /// Age at which an observation's recency score halves
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,

    /// Reliability assumed for sources nobody has scored
    #[serde(default = "default_source_reliability")]
    pub default_source_reliability: f64,

    /// Compare-and-swap retries before a commit gives up
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    #[serde(default = "default_ingestion_workers")]
    pub ingestion_workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_margin() -> f64 { 0.15 }
fn default_reliability_weight() -> f64 { 0.5 }
fn default_recency_weight() -> f64 { 0.2 }
fn default_corroboration_weight() -> f64 { 0.3 }
fn default_recency_half_life_days() -> f64 { 365.0 }
fn default_source_reliability() -> f64 { 0.5 }
fn default_max_cas_retries() -> u32 { 3 }
fn default_ingestion_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 1024 }

impl Default for TruthConfig {
    fn default() -> Self {
        Self {
            auto_resolve_margin: default_margin(),
            reliability_weight: default_reliability_weight(),
            recency_weight: default_recency_weight(),
            corroboration_weight: default_corroboration_weight(),
            recency_half_life_days: default_recency_half_life_days(),
            default_source_reliability: default_source_reliability(),
            max_cas_retries: default_max_cas_retries(),
            ingestion_workers: default_ingestion_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Query engine bounds and ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,

    /// Candidate matches enumerated before the result is marked partial
    #[serde(default = "default_result_cap")]
    pub result_cap: usize,

    #[serde(default = "default_k")]
    pub default_k: usize,

    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Nearest neighbours pulled from the embedding index per semantic seed
    #[serde(default = "default_semantic_neighbors")]
    pub semantic_neighbors: usize,

    #[serde(default)]
    pub ranking: RankingPolicy,
}

fn default_max_hops() -> usize { 3 }
fn default_result_cap() -> usize { 256 }
fn default_k() -> usize { 10 }
fn default_deadline_ms() -> u64 { 250 }
fn default_semantic_neighbors() -> usize { 16 }

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            result_cap: default_result_cap(),
            default_k: default_k(),
            deadline_ms: default_deadline_ms(),
            semantic_neighbors: default_semantic_neighbors(),
            ranking: RankingPolicy::default(),
        }
    }
}

impl QueryConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Working memory sizing and attention dynamics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemoryConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Time for an unrefreshed activation to halve
    #[serde(default = "default_half_life_secs")]
    pub half_life_secs: f64,

    #[serde(default = "default_activation")]
    pub default_activation: f64,

    #[serde(default = "default_high_confidence")]
    pub high_confidence_threshold: f64,

    #[serde(default = "default_boost")]
    pub confidence_boost: f64,

    #[serde(default = "default_novelty_threshold")]
    pub novelty_threshold: f64,

    #[serde(default = "default_boost")]
    pub novelty_boost: f64,

    /// Blend factor applied by `focus` between current activation and goal relevance
    #[serde(default = "default_focus_weight")]
    pub focus_weight: f64,
}

fn default_capacity() -> usize { 32 }
fn default_half_life_secs() -> f64 { 300.0 }
fn default_activation() -> f64 { 0.5 }
fn default_high_confidence() -> f64 { 0.85 }
fn default_boost() -> f64 { 0.1 }
fn default_novelty_threshold() -> f64 { 0.5 }
fn default_focus_weight() -> f64 { 0.5 }

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            half_life_secs: default_half_life_secs(),
            default_activation: default_activation(),
            high_confidence_threshold: default_high_confidence(),
            confidence_boost: default_boost(),
            novelty_threshold: default_novelty_threshold(),
            novelty_boost: default_boost(),
            focus_weight: default_focus_weight(),
        }
    }
}

/// Embedding index settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Fixed dimensionality; learned from the first record when unset
    #[serde(default)]
    pub dimension: Option<usize>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// MessagePack archive restored at startup and written on shutdown
    #[serde(default)]
    pub archive_path: Option<String>,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8081 }
fn default_body_limit() -> usize { 1_048_576 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            archive_path: None,
        }
    }
}

impl Config {
    /// Load defaults, then `knowledge.toml` if present, then the environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::with_name(DEFAULT_CONFIG_NAME).required(false))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, with environment overrides on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from_str(raw, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot honour
    pub fn validate(&self) -> Result<()> {
        let truth = &self.truth;
        if !(0.0..=1.0).contains(&truth.auto_resolve_margin) {
            return Err(KnowledgeError::Configuration(format!(
                "truth.auto_resolve_margin must be within [0, 1], got {}",
                truth.auto_resolve_margin
            )));
        }
        if truth.reliability_weight < 0.0
            || truth.recency_weight < 0.0
            || truth.corroboration_weight < 0.0
        {
            return Err(KnowledgeError::Configuration(
                "truth credibility weights must be non-negative".to_string(),
            ));
        }
        if truth.recency_half_life_days <= 0.0 {
            return Err(KnowledgeError::Configuration(
                "truth.recency_half_life_days must be positive".to_string(),
            ));
        }
        if truth.ingestion_workers == 0 || truth.queue_capacity == 0 {
            return Err(KnowledgeError::Configuration(
                "truth.ingestion_workers and truth.queue_capacity must be positive".to_string(),
            ));
        }
        if self.query.max_hops == 0 || self.query.result_cap == 0 {
            return Err(KnowledgeError::Configuration(
                "query.max_hops and query.result_cap must be positive".to_string(),
            ));
        }
        self.query.ranking.validate()?;
        let wm = &self.working_memory;
        if wm.capacity == 0 {
            return Err(KnowledgeError::Configuration(
                "working_memory.capacity must be positive".to_string(),
            ));
        }
        if wm.half_life_secs <= 0.0 {
            return Err(KnowledgeError::Configuration(
                "working_memory.half_life_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&wm.focus_weight) || !(0.0..=1.0).contains(&wm.default_activation) {
            return Err(KnowledgeError::Configuration(
                "working_memory.focus_weight and default_activation must be within [0, 1]"
                    .to_string(),
            ));
        }
        if self.embedding.dimension == Some(0) {
            return Err(KnowledgeError::Configuration(
                "embedding.dimension must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
