//! Embedding generation
//!
//! The embedding collaborator is external by contract: anything that maps a
//! string to a fixed-dimension vector, deterministically, in batches. The
//! shipped implementation derives vectors from a SHA-256 hash cycle, so the
//! same text always produces the same vector with no model runtime.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Fixed embedding dimension for every vector row.
pub const VECTOR_DIM: usize = 384;

/// Seam for the embedding collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, each `VECTOR_DIM` long.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        Ok(vectors.remove(0))
    }
}

/// Deterministic SHA-256 cycle embedder.
#[derive(Debug, Default, Clone)]
pub struct HashEmbedder;

impl HashEmbedder {
    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();

        let mut embedding = Vec::with_capacity(VECTOR_DIM);
        for i in 0..VECTOR_DIM {
            let byte = hash[i % hash.len()];
            embedding.push((byte as f32 / 128.0) - 1.0);
        }
        embedding
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dimension_and_range() {
        let embedding = HashEmbedder.embed("Test knowledge item").await.unwrap();
        assert_eq!(embedding.len(), VECTOR_DIM);
        assert!(embedding.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[tokio::test]
    async fn test_deterministic() {
        let a = HashEmbedder.embed("same text").await.unwrap();
        let b = HashEmbedder.embed("same text").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_batch_matches_single() {
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = HashEmbedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], HashEmbedder.embed("one").await.unwrap());
        assert_ne!(batch[0], batch[1]);
    }
}
