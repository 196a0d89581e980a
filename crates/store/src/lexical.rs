//! In-memory Okapi BM25 index.
//!
//! The index is rebuilt wholesale by [`LexicalIndex::index_documents`]. A
//! rebuild runs against a fresh [`Bm25Snapshot`] and swaps it in under a write
//! lock, so readers always see either the previous or the new corpus.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

use crate::tokenize::{DefaultTokenizer, Tokenizer};
use crate::Document;

/// BM25 parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Length normalization.
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// Errors raised while building or reading the lexical index.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexicalError {
    #[error("duplicate document id: {0}")]
    DuplicateId(String),
    #[error("document id must not be empty")]
    EmptyId,
    #[error("lexical index lock poisoned")]
    LockPoisoned,
}

/// Result of a lexical search, carrying the stored document fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalSearchResult {
    pub doc_id: String,
    pub score: f64,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// Retained row for a single indexed document.
#[derive(Debug, Clone)]
struct StoredDoc {
    id: String,
    text: String,
    metadata: BTreeMap<String, String>,
    length: usize,
}

/// Immutable statistics for one build of the corpus.
#[derive(Debug, Default)]
pub struct Bm25Snapshot {
    docs: Vec<StoredDoc>,
    by_id: HashMap<String, usize>,
    avgdl: f64,
    /// term -> (doc slot -> term frequency)
    postings: HashMap<String, HashMap<usize, u32>>,
    idf: HashMap<String, f64>,
}

impl Bm25Snapshot {
    fn build(docs: Vec<Document>, tokenizer: &dyn Tokenizer) -> Result<Self, LexicalError> {
        let mut seen = HashSet::with_capacity(docs.len());
        for doc in &docs {
            if doc.id.is_empty() {
                return Err(LexicalError::EmptyId);
            }
            if !seen.insert(doc.id.as_str()) {
                return Err(LexicalError::DuplicateId(doc.id.clone()));
            }
        }

        let tokenized: Vec<Vec<String>> = docs
            .par_iter()
            .map(|doc| tokenizer.tokenize(&doc.text))
            .collect();

        let mut postings: HashMap<String, HashMap<usize, u32>> = HashMap::new();
        let mut stored = Vec::with_capacity(docs.len());
        let mut by_id = HashMap::with_capacity(docs.len());
        let mut total_len = 0usize;

        for (slot, (doc, terms)) in docs.into_iter().zip(tokenized).enumerate() {
            total_len += terms.len();
            for term in &terms {
                *postings.entry(term.clone()).or_default().entry(slot).or_insert(0) += 1;
            }
            by_id.insert(doc.id.clone(), slot);
            stored.push(StoredDoc {
                id: doc.id,
                text: doc.text,
                metadata: doc.metadata,
                length: terms.len(),
            });
        }

        let n = stored.len() as f64;
        let avgdl = if stored.is_empty() { 0.0 } else { total_len as f64 / n };
        let idf = postings
            .iter()
            .map(|(term, docs)| {
                let df = docs.len() as f64;
                (term.clone(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();

        Ok(Self { docs: stored, by_id, avgdl, postings, idf })
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Average document length in tokens.
    pub fn avgdl(&self) -> f64 {
        self.avgdl
    }

    /// Number of distinct terms.
    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    /// IDF of `term`, if the term occurs in the corpus.
    pub fn idf(&self, term: &str) -> Option<f64> {
        self.idf.get(term).copied()
    }

    /// Token length of a document.
    pub fn doc_length(&self, doc_id: &str) -> Option<usize> {
        self.by_id.get(doc_id).map(|&slot| self.docs[slot].length)
    }

    /// Indexed ids in ingestion order.
    pub fn doc_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.docs.iter().map(|d| d.id.as_str())
    }

    fn score(&self, terms: &[String], params: Bm25Params) -> HashMap<usize, f64> {
        let mut scores: HashMap<usize, f64> = HashMap::new();
        if self.avgdl <= 0.0 {
            return scores;
        }
        for term in terms {
            let (Some(postings), Some(&idf)) = (self.postings.get(term), self.idf.get(term)) else {
                continue;
            };
            for (&slot, &tf) in postings {
                let tf = tf as f64;
                let len_norm = 1.0 - params.b + params.b * self.docs[slot].length as f64 / self.avgdl;
                let contribution = idf * tf * (params.k1 + 1.0) / (tf + params.k1 * len_norm);
                *scores.entry(slot).or_insert(0.0) += contribution;
            }
        }
        scores
    }
}

/// Thread-safe BM25 index with atomic rebuilds.
pub struct LexicalIndex {
    params: Bm25Params,
    tokenizer: Arc<dyn Tokenizer>,
    snapshot: RwLock<Arc<Bm25Snapshot>>,
}

impl Default for LexicalIndex {
    fn default() -> Self {
        Self::new(Bm25Params::default())
    }
}

impl LexicalIndex {
    /// Create an empty index using the default tokenizer.
    pub fn new(params: Bm25Params) -> Self {
        Self::with_tokenizer(params, Arc::new(DefaultTokenizer))
    }

    /// Create an empty index with a custom tokenizer.
    pub fn with_tokenizer(params: Bm25Params, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            params,
            tokenizer,
            snapshot: RwLock::new(Arc::new(Bm25Snapshot::default())),
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Replace the whole index with `docs`.
    ///
    /// Ids must be unique and non-empty. On error the previous index is kept.
    pub fn index_documents(&self, docs: Vec<Document>) -> Result<(), LexicalError> {
        let fresh = Arc::new(Bm25Snapshot::build(docs, self.tokenizer.as_ref())?);
        info!(
            "lexical index rebuilt: {} docs, {} terms, avgdl {:.2}",
            fresh.len(),
            fresh.vocabulary_size(),
            fresh.avgdl()
        );
        let mut guard = self.snapshot.write().map_err(|_| LexicalError::LockPoisoned)?;
        *guard = fresh;
        Ok(())
    }

    /// Current snapshot; stays valid even if a rebuild happens afterwards.
    pub fn snapshot(&self) -> Result<Arc<Bm25Snapshot>, LexicalError> {
        let guard = self.snapshot.read().map_err(|_| LexicalError::LockPoisoned)?;
        Ok(Arc::clone(&guard))
    }

    /// Score documents against `query`.
    ///
    /// Only documents containing at least one query term are scored. Results
    /// below `min_score` are dropped; the rest are sorted by score descending,
    /// then by id ascending, and truncated to `top_k`.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<(String, f64)>, LexicalError> {
        Ok(self
            .search_documents(query, top_k, min_score)?
            .into_iter()
            .map(|hit| (hit.doc_id, hit.score))
            .collect())
    }

    /// Same ranking as [`search`](Self::search), with text and metadata
    /// read from the same snapshot that produced the scores.
    pub fn search_documents(
        &self,
        query: &str,
        top_k: usize,
        min_score: f64,
    ) -> Result<Vec<LexicalSearchResult>, LexicalError> {
        let snapshot = self.snapshot()?;
        if top_k == 0 || snapshot.is_empty() {
            return Ok(vec![]);
        }
        let terms = self.tokenizer.tokenize(query);
        let mut scored: Vec<(usize, f64)> = snapshot
            .score(&terms, self.params)
            .into_iter()
            .filter(|&(_, score)| score >= min_score)
            .collect();
        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| snapshot.docs[a.0].id.cmp(&snapshot.docs[b.0].id))
        });
        scored.truncate(top_k);
        debug!("bm25 '{}': {} terms, {} hits", query, terms.len(), scored.len());

        Ok(scored
            .into_iter()
            .map(|(slot, score)| {
                let doc = &snapshot.docs[slot];
                LexicalSearchResult {
                    doc_id: doc.id.clone(),
                    score,
                    text: doc.text.clone(),
                    metadata: doc.metadata.clone(),
                }
            })
            .collect())
    }

    /// Stored text for `doc_id`.
    pub fn get_document_text(&self, doc_id: &str) -> Option<String> {
        let snapshot = self.snapshot().ok()?;
        let slot = *snapshot.by_id.get(doc_id)?;
        Some(snapshot.docs[slot].text.clone())
    }

    /// Stored metadata for `doc_id`.
    pub fn get_document_metadata(&self, doc_id: &str) -> Option<BTreeMap<String, String>> {
        let snapshot = self.snapshot().ok()?;
        let slot = *snapshot.by_id.get(doc_id)?;
        Some(snapshot.docs[slot].metadata.clone())
    }

    /// Number of indexed documents.
    pub fn count(&self) -> usize {
        self.snapshot().map(|s| s.len()).unwrap_or(0)
    }
}
