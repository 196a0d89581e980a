//! CLI entrypoint for Sift.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use embed::{Embedder, HashEmbedder};
use log::{debug, info};
use search::{EmbeddingReranker, ExpansionStrategy, SynonymExpander};
use sift_core::{Document, HybridRetriever, RetrievalMethod, RetrievalResponse, SiftConfig};
use store::{Bm25Params, InMemoryVectorStore, LexicalIndex};

#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Sift: hybrid BM25 + vector retrieval over a JSON-lines corpus", long_about = None)]
struct Cli {
    /// Config file (defaults to the standard lookup)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a corpus and print its statistics
    Index {
        /// JSON-lines file, one {"id", "text", "metadata"} object per line
        corpus: String,
    },
    /// Search for a query
    Search {
        query: String,
        #[arg(long)]
        corpus: String,
        /// keyword, vector, rrf or hybrid
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        top_k: Option<usize>,
        /// Metadata filter, key=value (repeatable)
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
        /// Diversify results with MMR
        #[arg(long)]
        mmr: bool,
        #[arg(long)]
        mmr_lambda: Option<f64>,
        #[arg(long)]
        min_score: Option<f64>,
        /// Query expansion: none, synonym or multi_query
        #[arg(long)]
        expand: Option<String>,
        /// Synonym table entry for expansion, term=alt1,alt2 (repeatable)
        #[arg(long = "synonym", value_name = "TERM=ALTS")]
        synonyms: Vec<String>,
        /// Rerank this many candidates by embedding similarity
        #[arg(long, value_name = "CANDIDATES")]
        rerank: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Explain a document by ID
    Explain {
        doc_id: String,
        #[arg(long)]
        corpus: String,
    },
    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a commented default config, or write it with --output
    Init {
        #[arg(long)]
        output: Option<String>,
    },
    /// Print where the config is read from
    Path,
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

fn load_config(path: Option<&str>) -> Result<SiftConfig> {
    match path {
        Some(p) => {
            let path = expand_path(p);
            SiftConfig::load_from(&path).with_context(|| format!("failed to load config {}", path.display()))
        }
        None => SiftConfig::load(),
    }
}

fn load_corpus(path: &str) -> Result<Vec<Document>> {
    let path = expand_path(path);
    let content = fs::read_to_string(&path).with_context(|| format!("failed to read corpus {}", path.display()))?;
    let mut docs = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid document", path.display(), line_no + 1))?;
        docs.push(doc);
    }
    debug!("loaded {} documents from {}", docs.len(), path.display());
    Ok(docs)
}

fn parse_pairs(raw: &[String], what: &str) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("{} must look like key=value, got '{}'", what, entry))?;
            if key.trim().is_empty() {
                bail!("{} key must not be empty in '{}'", what, entry);
            }
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn make_embedder(config: &SiftConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.embedding.dimension))),
        #[cfg(feature = "local")]
        "local" => Ok(Arc::new(embed::LocalEmbedder::new()?)),
        #[cfg(not(feature = "local"))]
        "local" => bail!("embedding provider 'local' needs a build with --features local"),
        other => bail!("unknown embedding provider: {}", other),
    }
}

/// Index `docs` lexically and load their embeddings into an in-memory store.
async fn build_engine(config: &SiftConfig, docs: Vec<Document>) -> Result<HybridRetriever> {
    let embedder = make_embedder(config)?;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let texts: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
    let embeddings = embedder.embed_batch(&texts).await?;
    for (doc, embedding) in docs.iter().zip(embeddings) {
        vectors.upsert(doc.id.clone(), embedding, doc.metadata.clone()).await?;
    }

    let engine = HybridRetriever::new(config)
        .with_embedder(Arc::clone(&embedder))
        .with_vector_search(vectors)
        .with_reranker(Arc::new(EmbeddingReranker::new(embedder)));
    engine.build_index(docs)?;
    Ok(engine)
}

fn print_response(query: &str, method: RetrievalMethod, response: &RetrievalResponse) {
    println!(
        "search: \"{}\" ({}, {} results{})",
        query,
        method,
        response.items.len(),
        if response.cached { ", cached" } else { "" }
    );
    for item in &response.items {
        println!("{:>3}. {}  score {:.4}  [{}]", item.rank, item.id, item.score, item.source);
        let snippet: String = item.text.chars().take(120).collect();
        println!("     {}", snippet);
    }
    for notice in &response.degradations {
        eprintln!("  warning: {}", notice);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Index { corpus } => {
            let docs = load_corpus(&corpus)?;
            let index = LexicalIndex::new(Bm25Params::from(&config.bm25));
            index.index_documents(docs)?;
            let snapshot = index.snapshot()?;
            println!(
                "Indexed {} documents ({} terms, avgdl {:.2})",
                snapshot.len(),
                snapshot.vocabulary_size(),
                snapshot.avgdl()
            );
        }
        Commands::Search {
            query,
            corpus,
            method,
            top_k,
            filters,
            mmr,
            mmr_lambda,
            min_score,
            expand,
            synonyms,
            rerank,
            json,
        } => {
            let method = match method {
                Some(m) => m.parse::<RetrievalMethod>()?,
                None => config.search.default_method,
            };
            let strategy = match expand {
                Some(s) => s.parse::<ExpansionStrategy>()?,
                None => config.search.expansion,
            };

            config.search.default_method = method;
            let retrieval = &mut config.retrieval;
            if let Some(k) = top_k {
                retrieval.top_k = k;
            }
            if let Some(lambda) = mmr_lambda {
                retrieval.mmr_lambda = lambda;
            }
            if let Some(score) = min_score {
                retrieval.min_score = score;
            }
            retrieval.enable_mmr |= mmr;
            retrieval.filters.extend(parse_pairs(&filters, "--filter")?);

            let mut expander = SynonymExpander::new();
            for (term, alts) in parse_pairs(&synonyms, "--synonym")? {
                expander = expander.with_synonyms(&term, alts.split(',').map(str::trim).filter(|a| !a.is_empty()));
            }

            let docs = load_corpus(&corpus)?;
            let engine = build_engine(&config, docs).await?.with_expander(Arc::new(expander));
            info!("searching {} documents for '{}'", engine.document_count(), query);

            let per_call = engine.defaults().clone();
            let response = match (rerank, strategy) {
                (Some(candidates), _) => engine.retrieve_with_rerank(&query, per_call.top_k, candidates).await?,
                (None, ExpansionStrategy::None) => engine.retrieve(&query, method, &per_call).await?,
                (None, strategy) => engine.retrieve_expanded(&query, strategy, &per_call).await?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&query, method, &response);
            }
        }
        Commands::Explain { doc_id, corpus } => {
            let docs = load_corpus(&corpus)?;
            let engine = HybridRetriever::new(&config);
            engine.build_index(docs)?;
            match engine.get_document_text(&doc_id) {
                Some(text) => {
                    println!("doc: {}", doc_id);
                    let metadata: BTreeMap<String, String> = engine.get_document_metadata(&doc_id).unwrap_or_default();
                    for (key, value) in &metadata {
                        println!("  {}: {}", key, value);
                    }
                    println!("{}", text);
                }
                None => bail!("document not found: {}", doc_id),
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { output } => {
                let content = SiftConfig::generate_default_config();
                match output {
                    Some(path) => {
                        let path = expand_path(&path);
                        if path.exists() {
                            bail!("{} already exists", path.display());
                        }
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(&path, content)?;
                        println!("Wrote {}", path.display());
                    }
                    None => print!("{}", content),
                }
            }
            ConfigAction::Path => match SiftConfig::find_config_file() {
                Some(path) => println!("{}", path.display()),
                None => match SiftConfig::default_config_path() {
                    Some(path) => println!("{} (not created)", path.display()),
                    None => bail!("no config directory on this platform"),
                },
            },
        },
    }
    Ok(())
}
