//! Retrieval orchestration.
//
// Dispatches a query to the lexical index and/or the vector collaborators,
// fuses both legs, filters, diversifies and caches the final list.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use embed::{cosine_similarity, Embedder};
use futures::future::join_all;
use log::{debug, info, warn};
use search::fusion::min_max_normalize;
use search::{
	assign_ranks, mmr_select, reciprocal_rank_fusion, weighted_score_blend, ExpansionStrategy,
	QueryExpander, Reranker, RetrievalSource, RetrievedItem,
};
use store::{
	matches_filters, Bm25Params, Document, LexicalError, LexicalIndex, LexicalSearchResult,
	Tokenizer, VectorSearch,
};

use crate::cache::{CacheKey, ResultCache};
use crate::config::{RetrievalConfig, SiftConfig};
use crate::error::{Collaborator, Result, RetrievalError};
use crate::{RetrievalMethod, RetrievalResponse};

/// Public entry point: owns the lexical index, the result cache and the
/// injected collaborators.
pub struct HybridRetriever {
	lexical: Arc<LexicalIndex>,
	embedder: Option<Arc<dyn Embedder>>,
	vector_search: Option<Arc<dyn VectorSearch>>,
	reranker: Option<Arc<dyn Reranker>>,
	expander: Option<Arc<dyn QueryExpander>>,
	cache: ResultCache<Vec<RetrievedItem>>,
	defaults: RetrievalConfig,
	default_method: RetrievalMethod,
	timeout: Duration,
	index_loaded: AtomicBool,
}

impl HybridRetriever {
	/// Build an engine with no collaborators. Cache capacity and TTL come
	/// from `config.retrieval`.
	pub fn new(config: &SiftConfig) -> Self {
		let defaults = config.retrieval.clone();
		Self {
			lexical: Arc::new(LexicalIndex::new(Bm25Params::from(&config.bm25))),
			embedder: None,
			vector_search: None,
			reranker: None,
			expander: None,
			cache: ResultCache::new(defaults.cache_ttl(), defaults.cache_max_entries),
			default_method: config.search.default_method,
			timeout: config.collaborators.timeout(),
			defaults,
			index_loaded: AtomicBool::new(false),
		}
	}

	pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
		self.embedder = Some(embedder);
		self
	}

	pub fn with_vector_search(mut self, backend: Arc<dyn VectorSearch>) -> Self {
		self.vector_search = Some(backend);
		self
	}

	pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
		self.reranker = Some(reranker);
		self
	}

	pub fn with_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
		self.expander = Some(expander);
		self
	}

	/// Swap the tokenizer. Drops any index built so far.
	pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
		let params = self.lexical.params();
		self.lexical = Arc::new(LexicalIndex::with_tokenizer(params, tokenizer));
		self.index_loaded = AtomicBool::new(false);
		self
	}

	/// Override the per-call collaborator timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn defaults(&self) -> &RetrievalConfig {
		&self.defaults
	}

	pub fn default_method(&self) -> RetrievalMethod {
		self.default_method
	}

	/// Replace the corpus. Cached results from the previous corpus are dropped.
	pub fn build_index(&self, documents: Vec<Document>) -> Result<()> {
		self.lexical.index_documents(documents).map_err(|e| match e {
			LexicalError::DuplicateId(_) | LexicalError::EmptyId => RetrievalError::validation(e.to_string()),
			LexicalError::LockPoisoned => RetrievalError::Index(e.to_string()),
		})?;
		self.index_loaded.store(true, Ordering::Release);
		self.cache.clear();
		info!("index loaded: {} documents, result cache cleared", self.lexical.count());
		Ok(())
	}

	pub fn is_index_loaded(&self) -> bool {
		self.index_loaded.load(Ordering::Acquire)
	}

	pub fn document_count(&self) -> usize {
		self.lexical.count()
	}

	pub fn get_document_text(&self, doc_id: &str) -> Option<String> {
		self.lexical.get_document_text(doc_id)
	}

	pub fn get_document_metadata(&self, doc_id: &str) -> Option<BTreeMap<String, String>> {
		self.lexical.get_document_metadata(doc_id)
	}

	pub fn clear_cache(&self) {
		self.cache.clear();
		info!("result cache cleared");
	}

	pub fn cache_len(&self) -> usize {
		self.cache.len()
	}

	/// Rank the corpus against `query`.
	///
	/// Cache hits come back with `cached = true`. Responses carrying
	/// degradation notices are returned but never cached.
	pub async fn retrieve(
		&self,
		query: &str,
		method: RetrievalMethod,
		config: &RetrievalConfig,
	) -> Result<RetrievalResponse> {
		validate_query(query)?;
		config.validate()?;

		let key = CacheKey::new(query, method, config.top_k, &config.filters);
		if config.enable_cache {
			if let Some(hit) = self.cache.get_with_ttl(&key, config.cache_ttl()) {
				debug!("cache hit for '{}' ({})", query, method);
				return Ok(RetrievalResponse {
					items: hit.as_ref().clone(),
					cached: true,
					degradations: Vec::new(),
				});
			}
		}

		// Results computed across a rebuild or clear must not be written back.
		let generation = self.cache.generation();
		let mut degradations = Vec::new();
		let mut items = self.dispatch(query, method, config, &mut degradations).await?;
		items.retain(|item| matches_filters(&item.metadata, &config.filters));
		if config.enable_mmr {
			items = self.diversify(items, config, &mut degradations).await;
		}
		items.truncate(config.top_k);
		assign_ranks(&mut items);
		debug!("'{}' ({}): {} items, {} degradations", query, method, items.len(), degradations.len());

		if config.enable_cache && degradations.is_empty() {
			self.cache.set_if_current(key, items.clone(), generation);
		}
		Ok(RetrievalResponse {
			items,
			cached: false,
			degradations,
		})
	}

	/// Retrieve `rerank_candidate_count` candidates with the default method,
	/// rerank them, and keep the top `top_k`.
	///
	/// A failing or missing reranker leaves the candidates in retrieval order;
	/// `cached` is then that of the candidate retrieval.
	pub async fn retrieve_with_rerank(
		&self,
		query: &str,
		top_k: usize,
		rerank_candidate_count: usize,
	) -> Result<RetrievalResponse> {
		if top_k == 0 {
			return Err(RetrievalError::validation("top_k must be at least 1"));
		}
		if rerank_candidate_count < top_k {
			return Err(RetrievalError::validation(format!(
				"rerank_candidate_count ({}) must be at least top_k ({})",
				rerank_candidate_count, top_k
			)));
		}
		let config = RetrievalConfig {
			top_k: rerank_candidate_count,
			..self.defaults.clone()
		};
		let mut response = self.retrieve(query, self.default_method, &config).await?;

		let candidates = std::mem::take(&mut response.items);
		let mut items = match self.rerank(query, &candidates).await {
			Ok(reranked) => {
				// Only the candidate stage can come from the cache.
				response.cached = false;
				reranked
			}
			Err(notice) => {
				warn!("{}", notice);
				response.degradations.push(notice);
				candidates
			}
		};
		items.truncate(top_k);
		assign_ranks(&mut items);
		response.items = items;
		Ok(response)
	}

	/// Query variants for `strategy`. `None` returns the query unchanged.
	pub async fn expand_query(&self, query: &str, strategy: ExpansionStrategy) -> Result<Vec<String>> {
		validate_query(query)?;
		if matches!(strategy, ExpansionStrategy::None) {
			return Ok(vec![query.to_string()]);
		}
		let expander = self.expander.as_ref().ok_or_else(|| {
			RetrievalError::collaborator(Collaborator::QueryExpansion, "no query expander configured")
		})?;
		let raw = self.call(Collaborator::QueryExpansion, expander.expand(query, strategy)).await?;

		let mut variants: Vec<String> = Vec::with_capacity(raw.len());
		for variant in raw {
			if !variant.trim().is_empty() && !variants.contains(&variant) {
				variants.push(variant);
			}
		}
		if variants.is_empty() {
			return Err(RetrievalError::collaborator(
				Collaborator::QueryExpansion,
				format!("expander '{}' returned no queries", expander.name()),
			));
		}
		debug!("expanded '{}' ({}) into {} queries", query, strategy, variants.len());
		Ok(variants)
	}

	/// Keyword search over every expansion of `query`, merged by id keeping
	/// the best score. Not cached.
	pub async fn retrieve_expanded(
		&self,
		query: &str,
		strategy: ExpansionStrategy,
		config: &RetrievalConfig,
	) -> Result<RetrievalResponse> {
		validate_query(query)?;
		config.validate()?;

		let mut degradations = Vec::new();
		let variants = match self.expand_query(query, strategy).await {
			Ok(variants) => variants,
			Err(e) if e.is_validation() => return Err(e),
			Err(e) => {
				warn!("{}; searching the original query only", e);
				degradations.push(format!("{}; searched the original query only", e));
				vec![query.to_string()]
			}
		};

		let fetch = config.fetch_count();
		let legs = join_all(
			variants
				.iter()
				.map(|variant| self.keyword_leg(variant, fetch, config.min_score)),
		)
		.await;

		let mut merged: HashMap<String, RetrievedItem> = HashMap::new();
		for leg in legs {
			match leg {
				Ok(items) => {
					for item in items {
						let better = merged
							.get(&item.id)
							.map_or(true, |existing| item.score > existing.score);
						if better {
							merged.insert(item.id.clone(), item);
						}
					}
				}
				Err(e) => {
					warn!("{}", e);
					degradations.push(e.to_string());
				}
			}
		}

		let mut items: Vec<RetrievedItem> = merged
			.into_values()
			.filter(|item| matches_filters(&item.metadata, &config.filters))
			.collect();
		items.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
		items.truncate(config.top_k);
		assign_ranks(&mut items);
		Ok(RetrievalResponse {
			items,
			cached: false,
			degradations,
		})
	}

	async fn dispatch(
		&self,
		query: &str,
		method: RetrievalMethod,
		config: &RetrievalConfig,
		degradations: &mut Vec<String>,
	) -> Result<Vec<RetrievedItem>> {
		let fetch = config.fetch_count();
		match method {
			RetrievalMethod::Keyword => match self.keyword_leg(query, fetch, config.min_score).await {
				Ok(items) => Ok(items),
				Err(e) => {
					warn!("{}", e);
					degradations.push(e.to_string());
					Ok(Vec::new())
				}
			},
			RetrievalMethod::Vector => self.vector_leg(query, fetch, &config.filters).await,
			RetrievalMethod::Rrf | RetrievalMethod::Hybrid => {
				let (keyword, vector) = tokio::join!(
					self.keyword_leg(query, fetch, config.min_score),
					self.vector_leg(query, fetch, &config.filters)
				);
				match (keyword, vector) {
					(Ok(keyword), Ok(vector)) => Ok(fuse(method, config, keyword, vector)),
					(Ok(keyword), Err(e)) => {
						warn!("{}; falling back to keyword results", e);
						degradations.push(format!("{}; fell back to keyword results", e));
						Ok(keyword)
					}
					(Err(e), Ok(vector)) => {
						warn!("{}; falling back to vector results", e);
						degradations.push(format!("{}; fell back to vector results", e));
						Ok(vector)
					}
					(Err(keyword_err), Err(vector_err)) => {
						warn!("both retrieval legs failed: {}; {}", keyword_err, vector_err);
						Err(vector_err)
					}
				}
			}
		}
	}

	async fn keyword_leg(&self, query: &str, fetch: usize, min_score: f64) -> Result<Vec<RetrievedItem>> {
		if !self.is_index_loaded() {
			debug!("keyword search before build_index; no hits");
			return Ok(Vec::new());
		}
		let lexical = Arc::clone(&self.lexical);
		let owned = query.to_string();
		let hits = tokio::task::spawn_blocking(move || lexical.search_documents(&owned, fetch, min_score))
			.await
			.map_err(|e| RetrievalError::Index(format!("keyword search task failed: {}", e)))?
			.map_err(|e| RetrievalError::Index(e.to_string()))?;

		let mut items: Vec<RetrievedItem> = hits.into_iter().map(keyword_item).collect();
		assign_ranks(&mut items);
		Ok(items)
	}

	async fn vector_leg(
		&self,
		query: &str,
		fetch: usize,
		filters: &BTreeMap<String, String>,
	) -> Result<Vec<RetrievedItem>> {
		let embedder = self.embedder.as_ref().ok_or_else(|| {
			RetrievalError::collaborator(Collaborator::Embedding, "no embedding provider configured")
		})?;
		let backend = self.vector_search.as_ref().ok_or_else(|| {
			RetrievalError::collaborator(Collaborator::VectorSearch, "no vector search backend configured")
		})?;

		let embedding = self.call(Collaborator::Embedding, embedder.embed(query)).await?;
		let hits = self
			.call(Collaborator::VectorSearch, backend.search(&embedding, fetch, filters))
			.await?;

		let mut items: Vec<RetrievedItem> = hits
			.into_iter()
			.take(fetch)
			.map(|hit| {
				let text = self.lexical.get_document_text(&hit.id).unwrap_or_default();
				let metadata = if hit.metadata.is_empty() {
					self.lexical.get_document_metadata(&hit.id).unwrap_or_default()
				} else {
					hit.metadata
				};
				RetrievedItem {
					id: hit.id,
					text,
					score: hit.score,
					metadata,
					source: RetrievalSource::Vector,
					rank: 0,
				}
			})
			.collect();
		assign_ranks(&mut items);
		Ok(items)
	}

	/// MMR over `items`, relevance min-max scaled, similarity from embeddings
	/// of the candidate texts.
	async fn diversify(
		&self,
		items: Vec<RetrievedItem>,
		config: &RetrievalConfig,
		degradations: &mut Vec<String>,
	) -> Vec<RetrievedItem> {
		if items.len() < 2 {
			return items;
		}
		let vectors = match self.candidate_embeddings(&items).await {
			Ok(vectors) => Some(vectors),
			Err(notice) => {
				warn!("{}", notice);
				degradations.push(notice);
				None
			}
		};

		let scored: Vec<(String, f64)> = items.iter().map(|i| (i.id.clone(), i.score)).collect();
		let relevance = min_max_normalize(&scored);
		let candidates: Vec<(String, f64)> = scored
			.iter()
			.map(|(id, _)| (id.clone(), relevance.get(id.as_str()).copied().unwrap_or(0.0)))
			.collect();
		let position: HashMap<&str, usize> = items
			.iter()
			.enumerate()
			.map(|(i, item)| (item.id.as_str(), i))
			.collect();

		let picks = mmr_select(&candidates, config.mmr_lambda, config.top_k, |a, b| {
			let vectors = vectors.as_ref()?;
			let (ia, ib) = (*position.get(a)?, *position.get(b)?);
			Some(cosine_similarity(&vectors[ia], &vectors[ib]) as f64)
		});

		let mut slots: Vec<Option<RetrievedItem>> = items.into_iter().map(Some).collect();
		let mut selected: Vec<RetrievedItem> = picks.into_iter().filter_map(|i| slots[i].take()).collect();
		assign_ranks(&mut selected);
		selected
	}

	async fn candidate_embeddings(&self, items: &[RetrievedItem]) -> std::result::Result<Vec<Vec<f32>>, String> {
		let Some(embedder) = &self.embedder else {
			return Err("no embedding provider; MMR similarity treated as 0".to_string());
		};
		let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
		let vectors = self
			.call(Collaborator::Embedding, embedder.embed_batch(&texts))
			.await
			.map_err(|e| format!("{}; MMR similarity treated as 0", e))?;
		if vectors.len() != items.len() {
			return Err(format!(
				"embedding provider returned {} vectors for {} candidates; MMR similarity treated as 0",
				vectors.len(),
				items.len()
			));
		}
		Ok(vectors)
	}

	async fn rerank(&self, query: &str, candidates: &[RetrievedItem]) -> std::result::Result<Vec<RetrievedItem>, String> {
		if candidates.is_empty() {
			return Ok(Vec::new());
		}
		let Some(reranker) = &self.reranker else {
			return Err("no reranker configured; returning unreranked candidates".to_string());
		};
		let reranked = self
			.call(Collaborator::Reranker, reranker.rerank(query, candidates.to_vec()))
			.await
			.map_err(|e| format!("{}; returning unreranked candidates", e))?;
		if !same_ids(candidates, &reranked) {
			return Err(format!(
				"reranker '{}' changed the candidate set; returning unreranked candidates",
				reranker.name()
			));
		}
		Ok(reranked)
	}

	/// Run a collaborator future under the configured timeout.
	async fn call<T, F>(&self, collaborator: Collaborator, fut: F) -> Result<T>
	where
		F: Future<Output = anyhow::Result<T>>,
	{
		match tokio::time::timeout(self.timeout, fut).await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(e)) => Err(RetrievalError::collaborator(collaborator, format!("{:#}", e))),
			Err(_) => Err(RetrievalError::collaborator(
				collaborator,
				format!("timed out after {} ms", self.timeout.as_millis()),
			)),
		}
	}
}

fn validate_query(query: &str) -> Result<()> {
	if query.trim().is_empty() {
		return Err(RetrievalError::validation("query must not be empty"));
	}
	Ok(())
}

fn keyword_item(hit: LexicalSearchResult) -> RetrievedItem {
	RetrievedItem {
		id: hit.doc_id,
		text: hit.text,
		score: hit.score,
		metadata: hit.metadata,
		source: RetrievalSource::Keyword,
		rank: 0,
	}
}

/// Merge the keyword and vector legs. HYBRID with both weights at zero
/// scores with RRF but keeps the HYBRID tag.
fn fuse(
	method: RetrievalMethod,
	config: &RetrievalConfig,
	keyword: Vec<RetrievedItem>,
	vector: Vec<RetrievedItem>,
) -> Vec<RetrievedItem> {
	let blend = method == RetrievalMethod::Hybrid && (config.vector_weight > 0.0 || config.keyword_weight > 0.0);
	let scored: Vec<(String, f64)> = if blend {
		let keyword_scores: Vec<(String, f64)> = keyword.iter().map(|i| (i.id.clone(), i.score)).collect();
		let vector_scores: Vec<(String, f64)> = vector.iter().map(|i| (i.id.clone(), i.score)).collect();
		weighted_score_blend(&[
			(config.vector_weight, vector_scores.as_slice()),
			(config.keyword_weight, keyword_scores.as_slice()),
		])
	} else {
		let lists: Vec<Vec<&str>> = vec![
			keyword.iter().map(|i| i.id.as_str()).collect(),
			vector.iter().map(|i| i.id.as_str()).collect(),
		];
		reciprocal_rank_fusion(&lists, config.rrf_k)
			.into_iter()
			.map(|hit| (hit.id, hit.score))
			.collect()
	};

	// Keyword rows win: their text and metadata come straight from the index.
	let mut rows: HashMap<String, RetrievedItem> = HashMap::new();
	for item in vector.into_iter().chain(keyword) {
		rows.insert(item.id.clone(), item);
	}
	let source = method.source();
	let mut fused: Vec<RetrievedItem> = scored
		.into_iter()
		.filter_map(|(id, score)| {
			let mut item = rows.remove(&id)?;
			item.score = score;
			item.source = source;
			Some(item)
		})
		.collect();
	assign_ranks(&mut fused);
	fused
}

fn same_ids(before: &[RetrievedItem], after: &[RetrievedItem]) -> bool {
	let mut a: Vec<&str> = before.iter().map(|i| i.id.as_str()).collect();
	let mut b: Vec<&str> = after.iter().map(|i| i.id.as_str()).collect();
	a.sort_unstable();
	b.sort_unstable();
	a == b
}
