//! Multi-query retrieval over one document's index.
//!
//! A question is expanded into paraphrases by the chat model; the original
//! and every paraphrase are embedded and looked up in the [`VectorIndex`],
//! and the hits are merged in first-seen order with duplicates dropped.
//! If the paraphrase call fails, retrieval continues with the original
//! question alone.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::CacheBackedEmbedder;
use crate::config::RetrievalConfig;
use crate::index::VectorIndex;
use crate::llm::ChatModel;
use crate::models::RetrievedContext;
use crate::prompt;

pub struct Retriever {
    embedder: CacheBackedEmbedder,
    index: VectorIndex,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
    query_count: usize,
}

impl Retriever {
    pub fn new(
        embedder: CacheBackedEmbedder,
        index: VectorIndex,
        chat: Arc<dyn ChatModel>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            chat,
            top_k: config.top_k,
            query_count: config.query_count,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn embedder(&self) -> &CacheBackedEmbedder {
        &self.embedder
    }

    /// The original question followed by up to `query_count` paraphrases.
    pub async fn expand_query(&self, question: &str) -> Vec<String> {
        let mut queries = vec![question.to_string()];
        if self.query_count == 0 {
            return queries;
        }

        let messages = prompt::paraphrase_messages(question, self.query_count);
        match self.chat.complete(&messages).await {
            Ok(reply) => {
                for q in prompt::parse_paraphrases(&reply, self.query_count) {
                    if !queries.contains(&q) {
                        queries.push(q);
                    }
                }
                tracing::debug!(queries = ?queries, "expanded question");
            }
            Err(e) => {
                tracing::warn!(error = %e, "query expansion failed; retrieving with the original question only");
            }
        }
        queries
    }

    /// Retrieve merged context for `question`.
    pub async fn retrieve(&self, question: &str) -> Result<RetrievedContext> {
        if self.index.is_empty() {
            return Ok(RetrievedContext {
                chunks: Vec::new(),
                queries: vec![question.to_string()],
            });
        }

        let queries = self.expand_query(question).await;
        let mut seen = HashSet::new();
        let mut chunks = Vec::new();
        for query in &queries {
            let vector = self.embedder.embed_query(query).await?;
            if vector.len() != self.index.dims() {
                bail!(
                    "query vector has {} dimensions but the index has {}",
                    vector.len(),
                    self.index.dims()
                );
            }
            for hit in self.index.search(&vector, self.top_k) {
                if seen.insert(hit.chunk.chunk_index) {
                    chunks.push(hit.chunk);
                }
            }
        }

        tracing::info!(
            queries = queries.len(),
            chunks = chunks.len(),
            "retrieved context"
        );
        Ok(RetrievedContext { chunks, queries })
    }
}
