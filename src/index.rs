//! In-memory vector index over one document's chunks.
//!
//! Built once from `(chunk, embedding)` pairs and read-only afterwards.
//! Lookup is brute-force cosine similarity, which is plenty for a single
//! uploaded document.

use anyhow::{bail, Result};

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, ScoredChunk};

struct IndexEntry {
    chunk: Chunk,
    vector: Vec<f32>,
}

pub struct VectorIndex {
    entries: Vec<IndexEntry>,
    dims: usize,
}

impl VectorIndex {
    /// Build the index. Every vector must have the same dimensionality.
    pub fn build(chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if chunks.len() != vectors.len() {
            bail!(
                "cannot index {} chunks with {} vectors",
                chunks.len(),
                vectors.len()
            );
        }
        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        if let Some(bad) = vectors.iter().position(|v| v.len() != dims) {
            bail!(
                "embedding {} has {} dimensions, expected {}",
                bad,
                vectors[bad].len(),
                dims
            );
        }

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();
        Ok(Self { entries, dims })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// The `k` most similar chunks, best first. Equal scores keep chunk order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(query, &e.vector)))
            .collect();
        // sort_by is stable, so ties stay in chunk order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredChunk {
                chunk: self.entries[i].chunk.clone(),
                score,
            })
            .collect()
    }
}
