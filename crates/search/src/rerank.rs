//! Second-stage re-ranking.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use embed::{cosine_similarity, Embedder};
use log::debug;

use crate::{assign_ranks, RetrievedItem};

/// Reorders a candidate list for a query.
///
/// Implementations return the same set of ids; they may rewrite scores.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: Vec<RetrievedItem>) -> Result<Vec<RetrievedItem>>;

    /// Get the name of this reranker.
    fn name(&self) -> &str;
}

/// Re-scores candidates by embedding cosine similarity to the query.
pub struct EmbeddingReranker {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingReranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rerank(&self, query: &str, mut candidates: Vec<RetrievedItem>) -> Result<Vec<RetrievedItem>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let query_vec = self.embedder.embed(query).await?;
        let texts: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != candidates.len() {
            bail!("embedder returned {} vectors for {} candidates", vectors.len(), candidates.len());
        }

        for (item, vector) in candidates.iter_mut().zip(&vectors) {
            item.score = cosine_similarity(&query_vec, vector) as f64;
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        assign_ranks(&mut candidates);
        debug!("reranked {} candidates for '{}'", candidates.len(), query);
        Ok(candidates)
    }

    fn name(&self) -> &str {
        "embedding"
    }
}
