//! Embedding abstraction for Sift.
//
// Provides a trait for generating vector embeddings from text, a deterministic
// hashing embedder that needs no model files, and (feature `local`) a
// fastembed-backed model.

use anyhow::Result;
use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;
use xxhash_rust::xxh3::xxh3_64;

#[cfg(feature = "local")]
mod local;
#[cfg(feature = "local")]
pub use local::LocalEmbedder;

/// Trait for generating embeddings from text.
#[async_trait]
pub trait Embedder: Send + Sync {
	async fn embed(&self, text: &str) -> Result<Vec<f32>>;
	/// Embed multiple texts in a batch for efficiency.
	async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
		let mut out = Vec::with_capacity(texts.len());
		for text in texts {
			out.push(self.embed(text).await?);
		}
		Ok(out)
	}
	/// Return the embedding dimension.
	fn dimension(&self) -> usize;
}

/// Cosine similarity; 0.0 for empty, mismatched or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
	if a.len() != b.len() || a.is_empty() {
		return 0.0;
	}
	let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
	let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
	let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
	if norm_a == 0.0 || norm_b == 0.0 {
		0.0
	} else {
		dot / (norm_a * norm_b)
	}
}

/// Signed feature-hashing embedder.
///
/// Each lowercased word (or CJK character) is hashed into one of `dim`
/// buckets with a hash-derived sign, then the vector is L2-normalized. Texts
/// sharing vocabulary land close together, which is enough for tests and for
/// running without a downloaded model.
pub struct HashEmbedder {
	dim: usize,
}

impl HashEmbedder {
	pub fn new(dim: usize) -> Self {
		Self { dim: dim.max(1) }
	}
}

impl Default for HashEmbedder {
	fn default() -> Self {
		Self::new(384)
	}
}

impl HashEmbedder {
	// Unicode word segmentation already yields ideographs one at a time.
	fn features(text: &str) -> impl Iterator<Item = String> + '_ {
		text.unicode_words().map(str::to_lowercase)
	}
}

#[async_trait]
impl Embedder for HashEmbedder {
	async fn embed(&self, text: &str) -> Result<Vec<f32>> {
		let mut v = vec![0.0f32; self.dim];
		for feature in Self::features(text) {
			let h = xxh3_64(feature.as_bytes());
			let bucket = (h % self.dim as u64) as usize;
			let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
			v[bucket] += sign;
		}
		let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
		if norm > 0.0 {
			v.iter_mut().for_each(|x| *x /= norm);
		}
		Ok(v)
	}

	fn dimension(&self) -> usize {
		self.dim
	}
}
