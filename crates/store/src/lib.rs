//! Document storage and first-stage retrieval for Sift.
//!
//! - [`LexicalIndex`]: in-memory BM25 over a document set.
//! - [`VectorSearch`]: seam for an external vector database, with
//!   [`InMemoryVectorStore`] as a brute-force cosine backend.

pub mod lexical;
pub mod tokenize;

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

pub use lexical::{Bm25Params, Bm25Snapshot, LexicalError, LexicalIndex, LexicalSearchResult};
pub use tokenize::{DefaultTokenizer, Tokenizer};

/// A document supplied by the caller for indexing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Builder-style metadata insert.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// True when `metadata` carries every filter key with an equal value.
pub fn matches_filters(metadata: &BTreeMap<String, String>, filters: &BTreeMap<String, String>) -> bool {
    filters
        .iter()
        .all(|(key, value)| metadata.get(key).is_some_and(|v| v == value))
}

/// A hit returned by a vector search backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
    pub metadata: BTreeMap<String, String>,
}

/// Approximate nearest-neighbour search over stored embeddings.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<VectorHit>>;
}

struct StoredVector {
    id: String,
    embedding: Vec<f32>,
    metadata: BTreeMap<String, String>,
}

/// Exhaustive cosine-similarity search held in memory.
#[derive(Default)]
pub struct InMemoryVectorStore {
    rows: RwLock<Vec<StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the embedding stored for `id`.
    pub async fn upsert(
        &self,
        id: impl Into<String>,
        embedding: Vec<f32>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let id = id.into();
        if id.is_empty() {
            bail!("vector id must not be empty");
        }
        let mut rows = self.rows.write().await;
        if let Some(dim) = rows.first().map(|r| r.embedding.len()) {
            if dim != embedding.len() {
                bail!("embedding dimension mismatch: expected {}, got {}", dim, embedding.len());
            }
        }
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.embedding = embedding;
                row.metadata = metadata;
            }
            None => rows.push(StoredVector { id, embedding, metadata }),
        }
        Ok(())
    }

    /// Drop every stored vector.
    pub async fn clear(&self) {
        self.rows.write().await.clear();
    }

    pub async fn count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl VectorSearch for InMemoryVectorStore {
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        filters: &BTreeMap<String, String>,
    ) -> Result<Vec<VectorHit>> {
        let rows = self.rows.read().await;
        let mut hits: Vec<VectorHit> = rows
            .iter()
            .filter(|row| matches_filters(&row.metadata, filters))
            .map(|row| VectorHit {
                id: row.id.clone(),
                score: embed::cosine_similarity(query_embedding, &row.embedding) as f64,
                metadata: row.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }
}
