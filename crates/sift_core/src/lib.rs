//! Hybrid retrieval engine for Sift.
//
// Ties the lexical index, vector collaborators, fusion, diversity selection
// and the result cache together behind `HybridRetriever`.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cache::{CacheKey, ResultCache};
pub use config::{RetrievalConfig, SiftConfig};
pub use engine::HybridRetriever;
pub use error::{Collaborator, Result, RetrievalError};
pub use search::{ExpansionStrategy, RetrievalSource, RetrievedItem};
pub use store::Document;

/// Retrieval strategy for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
	/// BM25 only.
	Keyword,
	/// Embedding + vector search only.
	Vector,
	/// Both legs fused with Reciprocal Rank Fusion.
	Rrf,
	/// Both legs fused with a weighted blend of normalized scores.
	Hybrid,
}

impl RetrievalMethod {
	/// Source tag for items produced by this method.
	pub fn source(self) -> RetrievalSource {
		match self {
			RetrievalMethod::Keyword => RetrievalSource::Keyword,
			RetrievalMethod::Vector => RetrievalSource::Vector,
			RetrievalMethod::Rrf => RetrievalSource::Rrf,
			RetrievalMethod::Hybrid => RetrievalSource::Hybrid,
		}
	}
}

impl fmt::Display for RetrievalMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.source().fmt(f)
	}
}

impl FromStr for RetrievalMethod {
	type Err = RetrievalError;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"keyword" | "lexical" | "bm25" => Ok(Self::Keyword),
			"vector" | "semantic" => Ok(Self::Vector),
			"rrf" => Ok(Self::Rrf),
			"hybrid" => Ok(Self::Hybrid),
			other => Err(RetrievalError::validation(format!("unknown retrieval method: {}", other))),
		}
	}
}

/// Items for one query plus out-of-band status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResponse {
	pub items: Vec<RetrievedItem>,
	/// Served from the result cache.
	pub cached: bool,
	/// Notices about legs or collaborators that failed and were skipped.
	pub degradations: Vec<String>,
}

impl RetrievalResponse {
	pub fn is_degraded(&self) -> bool {
		!self.degradations.is_empty()
	}
}
