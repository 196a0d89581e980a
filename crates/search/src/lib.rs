//! Hybrid ranking primitives for Sift.
//
// Rank fusion (RRF and weighted blending), MMR diversity selection, and the
// re-ranking / query-expansion collaborator seams.

pub mod expansion;
pub mod fusion;
pub mod mmr;
pub mod rerank;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use expansion::{ExpansionStrategy, QueryExpander, SynonymExpander};
pub use fusion::{reciprocal_rank_fusion, weighted_score_blend, FusedHit};
pub use mmr::mmr_select;
pub use rerank::{EmbeddingReranker, Reranker};

/// Which retrieval path produced an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
	Vector,
	Keyword,
	Rrf,
	Hybrid,
}

impl fmt::Display for RetrievalSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			RetrievalSource::Vector => "vector",
			RetrievalSource::Keyword => "keyword",
			RetrievalSource::Rrf => "rrf",
			RetrievalSource::Hybrid => "hybrid",
		};
		f.write_str(name)
	}
}

/// One ranked result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
	pub id: String,
	pub text: String,
	pub score: f64,
	pub metadata: BTreeMap<String, String>,
	pub source: RetrievalSource,
	/// 1-based position in the list it was returned in.
	pub rank: usize,
}

/// Reassign 1-based ranks after a reorder.
pub fn assign_ranks(items: &mut [RetrievedItem]) {
	for (i, item) in items.iter_mut().enumerate() {
		item.rank = i + 1;
	}
}
