//! Embedding provider seam for the memory service
//!
//! Vector search in episodic/semantic/procedural memory needs a function
//! that turns text into a fixed-dimension vector. The provider is an
//! injected dependency: the store only sees the trait. The built-in
//! `HashingProvider` is deterministic and dependency-free, which keeps
//! development and tests hermetic; real deployments can switch to a local
//! ONNX model via the `local-embeddings` feature.

use std::fmt;

/// A fixed-dimension embedding vector.
pub type Embedding = Vec<f32>;

/// Errors from embedding generation.
#[derive(Debug)]
pub enum EmbeddingError {
    /// The model could not be loaded
    ModelLoadError(String),
    /// Embedding generation failed
    Internal(String),
}

impl fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelLoadError(msg) => write!(f, "Model load error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for EmbeddingError {}

/// Text-to-vector provider. Implementations must produce vectors of a
/// single fixed dimension for the lifetime of the process; stored vectors
/// are only comparable against queries embedded by the same provider.
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Output vector dimension
    fn dimensions(&self) -> usize;

    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Embed a batch of texts (default: one at a time)
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deterministic hashing provider (default)
// ─────────────────────────────────────────────────────────────────────────────

/// Feature-hashing embedder: tokens (and token bigrams) are hashed into a
/// fixed number of buckets with a signed contribution, then the vector is
/// L2-normalized. No model download, stable across runs and platforms, and
/// texts sharing vocabulary land near each other — enough signal for
/// development and for exercising the ranking paths.
pub struct HashingProvider {
    dimensions: usize,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    /// FNV-1a, fixed offset/prime so vectors are reproducible everywhere.
    fn fnv1a(bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str) {
        let h = Self::fnv1a(feature.as_bytes());
        let bucket = (h % self.dimensions as u64) as usize;
        // Highest bit decides the sign so colliding features can cancel
        // instead of always inflating the same bucket.
        let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &'static str {
        "hashing"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimensions];

        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            self.accumulate(&mut vector, token);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]));
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local Provider (fastembed-rs / ONNX)
// ─────────────────────────────────────────────────────────────────────────────

/// Local embedding provider using ONNX models via fastembed-rs.
/// The model (~20-80MB) is downloaded on first use.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model: fastembed::TextEmbedding,
    dimensions: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(model_name: &str) -> Result<Self, EmbeddingError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let (model_enum, dimensions) = match model_name {
            "all-MiniLM-L6-v2" | "" => (EmbeddingModel::AllMiniLML6V2, 384),
            "all-MiniLM-L12-v2" => (EmbeddingModel::AllMiniLML12V2, 384),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            other => {
                return Err(EmbeddingError::ModelLoadError(format!(
                    "Unknown model: {}. Supported: all-MiniLM-L6-v2, all-MiniLM-L12-v2, bge-small-en-v1.5, bge-base-en-v1.5",
                    other
                )));
            }
        };

        tracing::info!(
            "Loading local embedding model: {} ({} dimensions)",
            model_name,
            dimensions
        );

        let model = TextEmbedding::try_new(InitOptions::new(model_enum)).map_err(|e| {
            EmbeddingError::ModelLoadError(format!("Failed to initialize model: {}", e))
        })?;

        Ok(Self { model, dimensions })
    }
}

#[cfg(feature = "local-embeddings")]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let embeddings = self
            .model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::Internal(format!("Embedding failed: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Internal("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let texts_owned: Vec<String> = texts.iter().map(|s| (*s).to_string()).collect();
        self.model
            .embed(texts_owned, None)
            .map_err(|e| EmbeddingError::Internal(format!("Batch embedding failed: {}", e)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Convert embedding to BLOB for SQLite storage.
///
/// Stores f32 values as little-endian bytes.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert BLOB back to embedding.
pub fn blob_to_embedding(blob: &[u8]) -> Embedding {
    let mut embedding = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        embedding.push(value);
    }
    embedding
}

/// Compute cosine similarity between two embeddings.
///
/// Returns a value between -1 and 1, where 1 is identical.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm = norm_a.sqrt() * norm_b.sqrt();
    if norm == 0.0 {
        0.0
    } else {
        dot_product / norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_provider_is_deterministic_and_normalized() {
        let provider = HashingProvider::new(64);
        let a = provider.embed("the quick brown fox").unwrap();
        let b = provider.embed("the quick brown fox").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let provider = HashingProvider::new(256);
        let doc = provider.embed("rust async runtime scheduling").unwrap();
        let near = provider.embed("async runtime in rust").unwrap();
        let far = provider.embed("grapefruit marmalade recipe").unwrap();

        assert!(cosine_similarity(&doc, &near) > cosine_similarity(&doc, &far));
    }

    #[test]
    fn blob_round_trip_is_exact() {
        let embedding = vec![0.25f32, -1.5, 0.0, 3.75];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }

    #[test]
    fn cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let provider = HashingProvider::new(32);
        let v = provider.embed("").unwrap();
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
