//! Configuration file handling for Sift.
//!
//! Loads settings from `sift.config.toml` with the following search order:
//! 1. Current directory
//! 2. ~/.config/sift/sift.config.toml (Linux), the platform config dir elsewhere
//! 3. ~/.sift/sift.config.toml

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use search::ExpansionStrategy;
use serde::{Deserialize, Serialize};
use store::Bm25Params;

use crate::error::RetrievalError;
use crate::RetrievalMethod;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SiftConfig {
    pub search: SearchConfig,
    pub retrieval: RetrievalConfig,
    pub bm25: Bm25Config,
    pub collaborators: CollaboratorConfig,
    pub embedding: EmbeddingConfig,
}

/// Search defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Method used when the caller does not pick one.
    pub default_method: RetrievalMethod,
    /// Query expansion applied by the CLI when none is given.
    pub expansion: ExpansionStrategy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_method: RetrievalMethod::Hybrid,
            expansion: ExpansionStrategy::None,
        }
    }
}

/// Per-query retrieval parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub rrf_k: u32,
    pub mmr_lambda: f64,
    /// Run MMR diversity selection before truncating.
    pub enable_mmr: bool,
    /// Lexical hits scoring below this are dropped.
    pub min_score: f64,
    /// Over-fetch factor per leg when filters or MMR will thin the list.
    pub candidate_multiplier: usize,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub enable_cache: bool,
    /// Exact-match metadata constraints.
    pub filters: BTreeMap<String, String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            vector_weight: 0.5,
            keyword_weight: 0.5,
            rrf_k: 60,
            mmr_lambda: 0.5,
            enable_mmr: false,
            min_score: 0.0,
            candidate_multiplier: 3,
            cache_ttl_seconds: 300,
            cache_max_entries: 128,
            enable_cache: true,
            filters: BTreeMap::new(),
        }
    }
}

impl RetrievalConfig {
    /// Check ranges. Weights may both be zero (HYBRID then uses RRF).
    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.top_k == 0 {
            return Err(RetrievalError::validation("top_k must be at least 1"));
        }
        if self.rrf_k == 0 {
            return Err(RetrievalError::validation("rrf_k must be greater than 0"));
        }
        for (name, value) in [
            ("vector_weight", self.vector_weight),
            ("keyword_weight", self.keyword_weight),
            ("mmr_lambda", self.mmr_lambda),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RetrievalError::validation(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !self.min_score.is_finite() {
            return Err(RetrievalError::validation("min_score must be finite"));
        }
        Ok(())
    }

    /// Builder-style filter insert.
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    /// How many candidates each retrieval leg should return.
    pub fn fetch_count(&self) -> usize {
        if self.filters.is_empty() && !self.enable_mmr {
            self.top_k
        } else {
            self.top_k.saturating_mul(self.candidate_multiplier.max(1))
        }
    }
}

/// BM25 parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Config {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Config {
    fn default() -> Self {
        let params = Bm25Params::default();
        Self { k1: params.k1, b: params.b }
    }
}

impl From<&Bm25Config> for Bm25Params {
    fn from(cfg: &Bm25Config) -> Self {
        Bm25Params { k1: cfg.k1, b: cfg.b }
    }
}

/// Limits applied to external collaborator calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl CollaboratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Embedding provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "hash" (built in, no model) or "local" (fastembed, needs the `local` feature).
    pub provider: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".into(),
            dimension: 384,
        }
    }
}

impl SiftConfig {
    /// Config file name.
    pub const FILENAME: &'static str = "sift.config.toml";

    /// Load configuration from file, searching standard locations.
    /// Returns default config if no file found.
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::find_config_file() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SiftConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Find config file in standard locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let current = PathBuf::from(Self::FILENAME);
        if current.exists() {
            return Some(current);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("sift").join(Self::FILENAME);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".sift").join(Self::FILENAME);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Get the default config file path for the current platform.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sift").join(Self::FILENAME))
    }

    /// Generate a default config file with comments.
    pub fn generate_default_config() -> String {
        r#"# Sift Configuration
# Place this file at:
#   - ./sift.config.toml (current directory)
#   - ~/.config/sift/sift.config.toml (Linux)
#   - ~/.sift/sift.config.toml

[search]
# Default method: "keyword", "vector", "rrf", or "hybrid"
default_method = "hybrid"

# Query expansion: "none", "synonym", or "multi_query"
expansion = "none"

[retrieval]
top_k = 5

# Weighted blend used by "hybrid"; both 0 falls back to RRF
vector_weight = 0.5
keyword_weight = 0.5

# Reciprocal Rank Fusion constant
rrf_k = 60

# MMR diversity (1.0 = pure relevance, 0.0 = pure novelty)
enable_mmr = false
mmr_lambda = 0.5

# Drop keyword hits below this BM25 score
min_score = 0.0

# Over-fetch per leg when filters or MMR are active
candidate_multiplier = 3

cache_ttl_seconds = 300
cache_max_entries = 128
enable_cache = true

[bm25]
k1 = 1.5
b = 0.75

[collaborators]
# Timeout for embedding, vector search, rerank and expansion calls
timeout_ms = 10000

[embedding]
# "hash" needs no model; "local" downloads all-MiniLM-L6-v2
provider = "hash"
dimension = 384
"#
        .to_string()
    }
}
