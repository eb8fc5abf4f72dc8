//! Similarity-search capability used by the embedding handler.
//!
//! Embeddings are opaque here: the index stores vectors by entity id and
//! answers nearest-neighbour queries. No ranking beyond raw cosine score.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::VectorError;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for `id`.
    async fn upsert(&self, id: &str, vector: Vec<f32>) -> Result<(), VectorError>;

    /// Up to `k` ids, most similar first.
    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>, VectorError>;
}

/// Brute-force cosine index held in process memory.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vectors.read().await.is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, id: &str, vector: Vec<f32>) -> Result<(), VectorError> {
        if vector.is_empty() {
            return Err(VectorError::Empty { id: id.to_string() });
        }
        let mut vectors = self.vectors.write().await;
        if let Some(expected) = vectors.values().next().map(Vec::len)
            && expected != vector.len()
            && !(vectors.len() == 1 && vectors.contains_key(id))
        {
            return Err(VectorError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        vectors.insert(id.to_string(), vector);
        Ok(())
    }

    async fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f32)>, VectorError> {
        let vectors = self.vectors.read().await;
        if let Some(expected) = vectors.values().next().map(Vec::len)
            && expected != vector.len()
        {
            return Err(VectorError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }

        let mut scored: Vec<(String, f32)> = vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine(vector, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nearest_orders_by_cosine() {
        let index = InMemoryVectorIndex::new();
        index.upsert("east", vec![1.0, 0.0]).await.unwrap();
        index.upsert("north", vec![0.0, 1.0]).await.unwrap();
        index.upsert("northeast", vec![1.0, 1.0]).await.unwrap();

        let hits = index.nearest(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].0, "east");
        assert_eq!(hits[1].0, "northeast");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces() {
        let index = InMemoryVectorIndex::new();
        index.upsert("a", vec![1.0, 0.0]).await.unwrap();
        index.upsert("a", vec![0.0, 1.0]).await.unwrap();
        assert_eq!(index.len().await, 1);
        let hits = index.nearest(&[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn dimension_mismatch_rejected() {
        let index = InMemoryVectorIndex::new();
        index.upsert("a", vec![1.0, 0.0]).await.unwrap();
        assert!(matches!(
            index.upsert("b", vec![1.0, 0.0, 0.0]).await,
            Err(VectorError::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert!(index.nearest(&[1.0], 1).await.is_err());
        assert!(matches!(index.upsert("c", vec![]).await, Err(VectorError::Empty { .. })));
    }
}
