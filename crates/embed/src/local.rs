use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::Embedder;

/// Local embedder using fastembed (runs entirely offline once downloaded).
pub struct LocalEmbedder {
	model: Mutex<TextEmbedding>,
	dim: usize,
}

impl LocalEmbedder {
	/// Create a LocalEmbedder with the default model (all-MiniLM-L6-v2, 384 dimensions).
	pub fn new() -> Result<Self> {
		Self::with_model(EmbeddingModel::AllMiniLML6V2, 384)
	}

	/// Create a LocalEmbedder with a specific model.
	pub fn with_model(model_name: EmbeddingModel, dim: usize) -> Result<Self> {
		let mut options = InitOptions::default();
		options.model_name = model_name;
		options.show_download_progress = true;
		let model = TextEmbedding::try_new(options)?;
		Ok(Self { model: Mutex::new(model), dim })
	}

	fn run(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
		let mut model = self.model.lock().map_err(|e| anyhow!("Model lock poisoned: {}", e))?;
		model.embed(texts, None)
	}
}

#[async_trait]
impl Embedder for LocalEmbedder {
	async fn embed(&self, text: &str) -> Result<Vec<f32>> {
		let embeddings = self.run(vec![text])?;
		embeddings.into_iter().next().ok_or_else(|| anyhow!("model returned no embedding"))
	}

	async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
		self.run(texts.to_vec())
	}

	fn dimension(&self) -> usize {
		self.dim
	}
}
