use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use embed::{Embedder, HashEmbedder};
use search::{EmbeddingReranker, ExpansionStrategy, Reranker, RetrievalSource, RetrievedItem, SynonymExpander};
use sift_core::{Collaborator, Document, HybridRetriever, RetrievalConfig, RetrievalError, RetrievalMethod, SiftConfig};
use store::{InMemoryVectorStore, LexicalIndex, VectorHit, VectorSearch};

fn ml_corpus() -> Vec<Document> {
    vec![
        Document::new("d1", "机器学习是人工智能的一个分支").with_meta("lang", "zh"),
        Document::new("d2", "深度学习是机器学习的子领域，使用神经网络").with_meta("lang", "zh"),
        Document::new("d3", "Machine learning models learn patterns from data").with_meta("lang", "en"),
        Document::new("d4", "Neural networks power deep learning systems").with_meta("lang", "en"),
        Document::new("d5", "自然语言处理让计算机理解人类语言").with_meta("lang", "zh"),
    ]
}

fn config_with(method: RetrievalMethod) -> SiftConfig {
    let mut config = SiftConfig::default();
    config.search.default_method = method;
    config
}

fn keyword_config(top_k: usize) -> RetrievalConfig {
    RetrievalConfig { top_k, ..Default::default() }
}

fn ids(items: &[RetrievedItem]) -> Vec<&str> {
    items.iter().map(|i| i.id.as_str()).collect()
}

fn keyword_engine() -> HybridRetriever {
    let engine = HybridRetriever::new(&config_with(RetrievalMethod::Keyword));
    engine.build_index(ml_corpus()).unwrap();
    engine
}

async fn vector_store(docs: &[Document], embedder: &HashEmbedder) -> Arc<InMemoryVectorStore> {
    let store = Arc::new(InMemoryVectorStore::new());
    for doc in docs {
        let embedding = embedder.embed(&doc.text).await.unwrap();
        store.upsert(doc.id.clone(), embedding, doc.metadata.clone()).await.unwrap();
    }
    store
}

async fn hybrid_engine(config: &SiftConfig) -> HybridRetriever {
    let embedder = HashEmbedder::default();
    let corpus = ml_corpus();
    let store = vector_store(&corpus, &embedder).await;
    let engine = HybridRetriever::new(config)
        .with_embedder(Arc::new(embedder))
        .with_vector_search(store);
    engine.build_index(corpus).unwrap();
    engine
}

struct FailingSearch;

#[async_trait]
impl VectorSearch for FailingSearch {
    async fn search(&self, _: &[f32], _: usize, _: &BTreeMap<String, String>) -> Result<Vec<VectorHit>> {
        bail!("connection refused")
    }
}

struct SlowSearch;

#[async_trait]
impl VectorSearch for SlowSearch {
    async fn search(&self, _: &[f32], _: usize, _: &BTreeMap<String, String>) -> Result<Vec<VectorHit>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![])
    }
}

/// Answers with no hits after a delay.
struct DelayedEmptySearch(Duration);

#[async_trait]
impl VectorSearch for DelayedEmptySearch {
    async fn search(&self, _: &[f32], _: usize, _: &BTreeMap<String, String>) -> Result<Vec<VectorHit>> {
        tokio::time::sleep(self.0).await;
        Ok(vec![])
    }
}

struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    async fn rerank(&self, _: &str, _: Vec<RetrievedItem>) -> Result<Vec<RetrievedItem>> {
        bail!("model unavailable")
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Returns only the last candidate.
struct DroppingReranker;

#[async_trait]
impl Reranker for DroppingReranker {
    async fn rerank(&self, _: &str, mut candidates: Vec<RetrievedItem>) -> Result<Vec<RetrievedItem>> {
        Ok(candidates.pop().into_iter().collect())
    }

    fn name(&self) -> &str {
        "dropping"
    }
}

#[tokio::test]
async fn keyword_end_to_end_chinese_query() {
    let engine = keyword_engine();
    let response = engine
        .retrieve("机器学习", RetrievalMethod::Keyword, &keyword_config(3))
        .await
        .unwrap();

    assert!(!response.items.is_empty());
    assert!(response.items.len() <= 3);
    assert!(!response.cached);
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Keyword));

    let reference = LexicalIndex::default();
    reference.index_documents(ml_corpus()).unwrap();
    let best = reference.search("机器学习", 1, 0.0).unwrap();
    assert_eq!(response.items[0].id, best[0].0);
    assert!(["d1", "d2"].contains(&response.items[0].id.as_str()));
    assert_eq!(response.items[0].rank, 1);
    assert_eq!(response.items[0].metadata["lang"], "zh");
}

#[tokio::test]
async fn absent_term_with_min_score_is_empty() {
    let engine = keyword_engine();
    let config = RetrievalConfig {
        top_k: 3,
        min_score: 0.01,
        ..Default::default()
    };
    let response = engine.retrieve("量子", RetrievalMethod::Keyword, &config).await.unwrap();
    assert!(response.items.is_empty());
    assert!(!response.is_degraded());
}

#[tokio::test]
async fn second_identical_call_is_cached() {
    let engine = keyword_engine();
    let config = keyword_config(3);

    let first = engine.retrieve("machine learning", RetrievalMethod::Keyword, &config).await.unwrap();
    let second = engine.retrieve("  Machine  LEARNING ", RetrievalMethod::Keyword, &config).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.items, second.items);
    assert_eq!(engine.cache_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_expires_after_ttl() {
    let engine = keyword_engine();
    let config = RetrievalConfig {
        top_k: 3,
        cache_ttl_seconds: 10,
        ..Default::default()
    };

    engine.retrieve("learning", RetrievalMethod::Keyword, &config).await.unwrap();
    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(engine.retrieve("learning", RetrievalMethod::Keyword, &config).await.unwrap().cached);

    tokio::time::advance(Duration::from_secs(2)).await;
    let after = engine.retrieve("learning", RetrievalMethod::Keyword, &config).await.unwrap();
    assert!(!after.cached);
    assert!(!after.items.is_empty());
}

#[tokio::test]
async fn cache_respects_capacity() {
    let mut config = config_with(RetrievalMethod::Keyword);
    config.retrieval.cache_max_entries = 2;
    let engine = HybridRetriever::new(&config);
    engine.build_index(ml_corpus()).unwrap();
    let per_call = config.retrieval.clone();

    for q in ["machine", "neural", "data"] {
        engine.retrieve(q, RetrievalMethod::Keyword, &per_call).await.unwrap();
        assert!(engine.cache_len() <= 2);
    }
    assert_eq!(engine.cache_len(), 2);

    // "machine" was inserted first and is gone; "data" survives re-inserting it.
    assert!(!engine.retrieve("machine", RetrievalMethod::Keyword, &per_call).await.unwrap().cached);
    assert!(engine.retrieve("data", RetrievalMethod::Keyword, &per_call).await.unwrap().cached);
}

#[tokio::test]
async fn disabled_cache_never_stores() {
    let engine = keyword_engine();
    let config = RetrievalConfig {
        enable_cache: false,
        ..Default::default()
    };
    engine.retrieve("learning", RetrievalMethod::Keyword, &config).await.unwrap();
    let again = engine.retrieve("learning", RetrievalMethod::Keyword, &config).await.unwrap();
    assert!(!again.cached);
    assert_eq!(engine.cache_len(), 0);
}

#[tokio::test]
async fn rebuild_clears_cache() {
    let engine = keyword_engine();
    engine.retrieve("learning", RetrievalMethod::Keyword, &keyword_config(3)).await.unwrap();
    assert_eq!(engine.cache_len(), 1);

    engine.build_index(ml_corpus()).unwrap();
    assert_eq!(engine.cache_len(), 0);
}

#[tokio::test]
async fn filters_exclude_mismatching_metadata() {
    let engine = keyword_engine();
    let config = keyword_config(5).with_filter("lang", "en");
    let response = engine.retrieve("learning 学习", RetrievalMethod::Keyword, &config).await.unwrap();

    assert!(!response.items.is_empty());
    assert!(response.items.iter().all(|i| i.metadata["lang"] == "en"));

    let missing_key = keyword_config(5).with_filter("author", "someone");
    let response = engine.retrieve("learning", RetrievalMethod::Keyword, &missing_key).await.unwrap();
    assert!(response.items.is_empty());
}

#[tokio::test]
async fn rrf_fuses_both_legs() {
    let engine = hybrid_engine(&SiftConfig::default()).await;
    let response = engine
        .retrieve("deep learning neural networks", RetrievalMethod::Rrf, &keyword_config(3))
        .await
        .unwrap();

    assert!(!response.is_degraded());
    assert_eq!(response.items.len(), 3);
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Rrf));
    assert_eq!(response.items.iter().map(|i| i.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(response.items[0].id, "d4");
    assert!(!response.items[0].text.is_empty());
}

#[tokio::test]
async fn hybrid_blend_scores_are_normalized() {
    let engine = hybrid_engine(&SiftConfig::default()).await;
    let response = engine
        .retrieve("machine learning", RetrievalMethod::Hybrid, &keyword_config(5))
        .await
        .unwrap();

    assert!(!response.items.is_empty());
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Hybrid));
    assert!(response.items.iter().all(|i| (0.0..=1.0).contains(&i.score)));
    for pair in response.items.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn vector_only_retrieval() {
    let engine = hybrid_engine(&SiftConfig::default()).await;
    let config = keyword_config(2).with_filter("lang", "en");
    let response = engine.retrieve("neural networks", RetrievalMethod::Vector, &config).await.unwrap();

    assert_eq!(response.items.len(), 2);
    assert_eq!(response.items[0].id, "d4");
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Vector));
    assert_eq!(response.items[0].text, "Neural networks power deep learning systems");
}

#[tokio::test]
async fn failed_vector_leg_degrades_to_keyword() {
    let engine = HybridRetriever::new(&SiftConfig::default())
        .with_embedder(Arc::new(HashEmbedder::default()))
        .with_vector_search(Arc::new(FailingSearch));
    engine.build_index(ml_corpus()).unwrap();

    let response = engine.retrieve("learning", RetrievalMethod::Rrf, &keyword_config(3)).await.unwrap();
    assert!(response.is_degraded());
    assert!(response.degradations[0].contains("connection refused"));
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Keyword));
    assert!(!response.items.is_empty());
    assert_eq!(engine.cache_len(), 0);

    let err = engine
        .retrieve("learning", RetrievalMethod::Vector, &keyword_config(3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::Collaborator { collaborator: Collaborator::VectorSearch, .. }
    ));
}

#[tokio::test]
async fn slow_vector_leg_times_out() {
    let engine = HybridRetriever::new(&SiftConfig::default())
        .with_embedder(Arc::new(HashEmbedder::default()))
        .with_vector_search(Arc::new(SlowSearch))
        .with_timeout(Duration::from_millis(50));
    engine.build_index(ml_corpus()).unwrap();

    let response = engine.retrieve("learning", RetrievalMethod::Hybrid, &keyword_config(3)).await.unwrap();
    assert!(response.degradations.iter().any(|d| d.contains("timed out")));
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Keyword));

    match engine.retrieve("learning", RetrievalMethod::Vector, &keyword_config(3)).await {
        Err(RetrievalError::Collaborator { collaborator, message }) => {
            assert_eq!(collaborator, Collaborator::VectorSearch);
            assert!(message.contains("timed out after 50 ms"));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_embedder_fails_vector_method() {
    let engine = keyword_engine();
    let err = engine
        .retrieve("learning", RetrievalMethod::Vector, &keyword_config(3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::Collaborator { collaborator: Collaborator::Embedding, .. }
    ));
}

#[tokio::test]
async fn validation_errors() {
    let engine = keyword_engine();

    let err = engine.retrieve("   ", RetrievalMethod::Keyword, &keyword_config(3)).await.unwrap_err();
    assert!(err.is_validation());

    let err = engine.retrieve("learning", RetrievalMethod::Keyword, &keyword_config(0)).await.unwrap_err();
    assert!(err.is_validation());

    let bad_lambda = RetrievalConfig {
        mmr_lambda: 1.5,
        ..Default::default()
    };
    let err = engine.retrieve("learning", RetrievalMethod::Keyword, &bad_lambda).await.unwrap_err();
    assert!(err.is_validation());

    assert!("fuzzy".parse::<RetrievalMethod>().unwrap_err().is_validation());
}

#[tokio::test]
async fn duplicate_ids_rejected_and_previous_index_kept() {
    let engine = keyword_engine();
    let err = engine
        .build_index(vec![Document::new("x", "one"), Document::new("x", "two")])
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(engine.document_count(), 5);
    assert_eq!(
        engine.get_document_text("d3").as_deref(),
        Some("Machine learning models learn patterns from data")
    );
}

#[tokio::test]
async fn query_before_build_index_is_empty() {
    let engine = HybridRetriever::new(&SiftConfig::default());
    assert!(!engine.is_index_loaded());
    let response = engine.retrieve("learning", RetrievalMethod::Keyword, &keyword_config(3)).await.unwrap();
    assert!(response.items.is_empty());
    assert!(!response.is_degraded());
}

#[tokio::test]
async fn empty_corpus_is_valid() {
    let engine = HybridRetriever::new(&SiftConfig::default());
    engine.build_index(vec![]).unwrap();
    assert!(engine.is_index_loaded());
    assert_eq!(engine.document_count(), 0);
    let response = engine.retrieve("x", RetrievalMethod::Keyword, &keyword_config(3)).await.unwrap();
    assert!(response.items.is_empty());
}

#[tokio::test]
async fn rerank_reorders_top_k() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let engine = HybridRetriever::new(&config_with(RetrievalMethod::Keyword))
        .with_reranker(Arc::new(EmbeddingReranker::new(Arc::clone(&embedder))));
    engine.build_index(ml_corpus()).unwrap();

    let response = engine.retrieve_with_rerank("learning networks", 2, 4).await.unwrap();
    assert!(!response.is_degraded());
    assert_eq!(response.items.len(), 2);
    assert_eq!(response.items.iter().map(|i| i.rank).collect::<Vec<_>>(), vec![1, 2]);
    assert!(response.items[0].score >= response.items[1].score);
}

#[tokio::test]
async fn failed_reranker_returns_unreranked() {
    let engine = HybridRetriever::new(&config_with(RetrievalMethod::Keyword)).with_reranker(Arc::new(FailingReranker));
    engine.build_index(ml_corpus()).unwrap();

    let baseline = engine
        .retrieve("learning networks", RetrievalMethod::Keyword, &keyword_config(4))
        .await
        .unwrap();
    let response = engine.retrieve_with_rerank("learning networks", 2, 4).await.unwrap();

    assert!(response.is_degraded());
    assert!(response.degradations[0].contains("model unavailable"));
    assert_eq!(ids(&response.items), ids(&baseline.items[..2]));
}

#[tokio::test]
async fn reranker_changing_candidates_is_ignored() {
    let engine = HybridRetriever::new(&config_with(RetrievalMethod::Keyword)).with_reranker(Arc::new(DroppingReranker));
    engine.build_index(ml_corpus()).unwrap();

    let response = engine.retrieve_with_rerank("learning", 2, 3).await.unwrap();
    assert!(response.is_degraded());
    assert_eq!(response.items.len(), 2);
}

#[tokio::test]
async fn rerank_candidate_count_below_top_k_is_invalid() {
    let engine = keyword_engine();
    let err = engine.retrieve_with_rerank("learning", 5, 3).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn expansion_merges_variants() {
    let expander = SynonymExpander::new().with_synonyms("ml", ["machine"]);
    let engine = HybridRetriever::new(&SiftConfig::default()).with_expander(Arc::new(expander));
    engine.build_index(ml_corpus()).unwrap();

    let variants = engine.expand_query("ml models", ExpansionStrategy::MultiQuery).await.unwrap();
    assert_eq!(variants, vec!["ml models".to_string(), "machine models".to_string()]);

    let none = engine.expand_query("ml models", ExpansionStrategy::None).await.unwrap();
    assert_eq!(none, vec!["ml models".to_string()]);

    let response = engine
        .retrieve_expanded("ml models", ExpansionStrategy::MultiQuery, &keyword_config(3))
        .await
        .unwrap();
    assert!(!response.is_degraded());
    assert_eq!(response.items[0].id, "d3");
    assert!(response.items.iter().all(|i| i.source == RetrievalSource::Keyword));

    // Best score per document across variants.
    let direct = engine
        .retrieve("machine models", RetrievalMethod::Keyword, &keyword_config(3))
        .await
        .unwrap();
    assert_eq!(response.items[0].score, direct.items[0].score);
}

#[tokio::test]
async fn missing_expander_degrades_to_original_query() {
    let engine = keyword_engine();
    let err = engine.expand_query("learning", ExpansionStrategy::Synonym).await.unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::Collaborator { collaborator: Collaborator::QueryExpansion, .. }
    ));

    let response = engine
        .retrieve_expanded("learning", ExpansionStrategy::Synonym, &keyword_config(3))
        .await
        .unwrap();
    assert!(response.is_degraded());
    assert!(!response.items.is_empty());
}

#[tokio::test]
async fn mmr_with_lambda_one_keeps_relevance_order() {
    let engine = HybridRetriever::new(&config_with(RetrievalMethod::Keyword))
        .with_embedder(Arc::new(HashEmbedder::default()));
    engine.build_index(ml_corpus()).unwrap();

    let plain = RetrievalConfig {
        top_k: 3,
        enable_cache: false,
        ..Default::default()
    };
    let mmr = RetrievalConfig {
        enable_mmr: true,
        mmr_lambda: 1.0,
        ..plain.clone()
    };
    let a = engine.retrieve("learning 学习", RetrievalMethod::Keyword, &plain).await.unwrap();
    let b = engine.retrieve("learning 学习", RetrievalMethod::Keyword, &mmr).await.unwrap();
    assert!(!b.is_degraded());
    assert_eq!(ids(&a.items), ids(&b.items));
}

#[tokio::test]
async fn mmr_with_lambda_zero_skips_near_duplicates() {
    let engine = HybridRetriever::new(&SiftConfig::default()).with_embedder(Arc::new(HashEmbedder::default()));
    engine
        .build_index(vec![
            Document::new("a", "rust async runtime with tokio"),
            Document::new("b", "rust async runtime with tokio"),
            Document::new("c", "rust bindings for pandas dataframes"),
        ])
        .unwrap();

    let config = RetrievalConfig {
        top_k: 2,
        enable_mmr: true,
        mmr_lambda: 0.0,
        enable_cache: false,
        ..Default::default()
    };
    let response = engine.retrieve("rust async", RetrievalMethod::Keyword, &config).await.unwrap();
    assert_eq!(ids(&response.items), vec!["a", "c"]);
    assert_eq!(response.items[1].rank, 2);
}

#[tokio::test]
async fn concurrent_retrievals_share_cache() {
    let engine = keyword_engine();
    let config = keyword_config(3);
    let (a, b) = tokio::join!(
        engine.retrieve("neural networks", RetrievalMethod::Keyword, &config),
        engine.retrieve("machine learning", RetrievalMethod::Keyword, &config)
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(engine.cache_len(), 2);

    engine.clear_cache();
    assert_eq!(engine.cache_len(), 0);
    assert!(!engine.retrieve("neural networks", RetrievalMethod::Keyword, &config).await.unwrap().cached);
}

#[tokio::test]
async fn rebuild_during_query_does_not_cache_old_corpus() {
    let engine = HybridRetriever::new(&SiftConfig::default())
        .with_embedder(Arc::new(HashEmbedder::default()))
        .with_vector_search(Arc::new(DelayedEmptySearch(Duration::from_millis(300))));
    engine.build_index(vec![Document::new("old", "learning from the old corpus")]).unwrap();
    let config = keyword_config(3);

    let (in_flight, rebuilt) = tokio::join!(engine.retrieve("learning", RetrievalMethod::Rrf, &config), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.build_index(vec![Document::new("new", "learning from the new corpus")])
    });
    rebuilt.unwrap();
    assert_eq!(ids(&in_flight.unwrap().items), vec!["old"]);
    assert_eq!(engine.cache_len(), 0);

    let after = engine.retrieve("learning", RetrievalMethod::Rrf, &config).await.unwrap();
    assert!(!after.cached);
    assert_eq!(ids(&after.items), vec!["new"]);
    assert_eq!(engine.document_count(), 1);
}

#[tokio::test]
async fn clear_during_query_does_not_cache_result() {
    let engine = HybridRetriever::new(&SiftConfig::default())
        .with_embedder(Arc::new(HashEmbedder::default()))
        .with_vector_search(Arc::new(DelayedEmptySearch(Duration::from_millis(200))));
    engine.build_index(ml_corpus()).unwrap();
    let config = keyword_config(3);

    let (in_flight, _) = tokio::join!(engine.retrieve("learning", RetrievalMethod::Hybrid, &config), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.clear_cache();
    });
    assert!(!in_flight.unwrap().items.is_empty());
    assert_eq!(engine.cache_len(), 0);
    assert!(!engine.retrieve("learning", RetrievalMethod::Hybrid, &config).await.unwrap().cached);
}

#[tokio::test]
async fn reranked_response_is_not_flagged_cached() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let engine = HybridRetriever::new(&config_with(RetrievalMethod::Keyword))
        .with_reranker(Arc::new(EmbeddingReranker::new(embedder)));
    engine.build_index(ml_corpus()).unwrap();

    let first = engine.retrieve_with_rerank("learning networks", 2, 4).await.unwrap();
    // Candidates now come from the cache, the reranking does not.
    let second = engine.retrieve_with_rerank("learning networks", 2, 4).await.unwrap();
    assert_eq!(engine.cache_len(), 1);
    assert!(!first.cached);
    assert!(!second.cached);
    assert_eq!(ids(&first.items), ids(&second.items));
}
