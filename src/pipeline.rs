//! Document loading.
//!
//! A [`Pipeline`] holds the configuration and the shared provider handles.
//! Loading a document runs, in order:
//!
//! 1. file-type check (nothing is written for unsupported types)
//! 2. raw bytes written to `<root>/<namespace>/<filename>/<filename>`
//! 3. concurrently: archival upload, and extract → chunk → embed → index
//!
//! Archival failures are logged and never fail the load. Any other failure
//! aborts it; cached vectors computed before the failure are not written.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::archive::{self, Archiver};
use crate::cache::{CacheBackedEmbedder, DocumentDir, EmbeddingCache};
use crate::chunk;
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::extract;
use crate::index::VectorIndex;
use crate::llm::{self, ChatModel};
use crate::models::UploadedFile;
use crate::progress::{LoadProgressEvent, LoadProgressReporter};
use crate::retriever::Retriever;

/// Shared, immutable handles used by every session.
pub struct Pipeline {
    config: Config,
    embeddings: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatModel>,
    archiver: Arc<dyn Archiver>,
}

/// Counts reported after a successful load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadStats {
    pub filename: String,
    pub chunks: usize,
    /// Chunk texts sent to the embedding provider.
    pub embedded: usize,
    /// Chunk texts served from the local cache.
    pub cached: usize,
    /// The document directory already held an embedding cache.
    pub reused: bool,
    pub archived: bool,
}

/// A processed document ready for questions.
pub struct LoadedDocument {
    pub dir: DocumentDir,
    pub retriever: Retriever,
    pub stats: LoadStats,
}

impl Pipeline {
    pub fn new(
        config: Config,
        embeddings: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatModel>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            config,
            embeddings,
            chat,
            archiver,
        }
    }

    /// Build providers from configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let embeddings: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        let chat: Arc<dyn ChatModel> = Arc::from(llm::create_chat_model(&config.chat)?);
        let archiver: Arc<dyn Archiver> = Arc::from(archive::create_archiver(&config.archive)?);
        Ok(Self::new(config, embeddings, chat, archiver))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chat(&self) -> &Arc<dyn ChatModel> {
        &self.chat
    }

    /// Load `file` for `namespace`, reusing any cached embeddings.
    pub async fn load_document(
        &self,
        namespace: &str,
        file: &UploadedFile,
        progress: &dyn LoadProgressReporter,
    ) -> Result<LoadedDocument> {
        extract::check_supported(file)?;
        let dir = DocumentDir::new(&self.config.cache.root, namespace, &file.filename)?;
        let reused = dir.exists();
        dir.write_raw(&file.bytes).await?;

        let archive = async {
            match self.archiver.upload(dir.filename(), &file.bytes).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        file = dir.filename(),
                        destination = %self.archiver.destination(),
                        error = %format!("{:#}", e),
                        "archival upload failed"
                    );
                    false
                }
            }
        };
        let (archived, processed) = tokio::join!(archive, self.build_retriever(&dir, file, progress));
        let (retriever, chunks, embedded, cached) = processed?;

        let stats = LoadStats {
            filename: dir.filename().to_string(),
            chunks,
            embedded,
            cached,
            reused,
            archived,
        };
        tracing::info!(
            file = %stats.filename,
            namespace,
            chunks = stats.chunks,
            embedded = stats.embedded,
            cached = stats.cached,
            "document loaded"
        );
        Ok(LoadedDocument {
            dir,
            retriever,
            stats,
        })
    }

    async fn build_retriever(
        &self,
        dir: &DocumentDir,
        file: &UploadedFile,
        progress: &dyn LoadProgressReporter,
    ) -> Result<(Retriever, usize, usize, usize)> {
        let filename = dir.filename().to_string();
        progress.report(LoadProgressEvent::Extracting {
            filename: filename.clone(),
        });
        let owned = file.clone();
        let text = tokio::task::spawn_blocking(move || extract::extract_text(&owned))
            .await
            .context("text extraction task panicked")??;

        let chunks = chunk::chunk_document(&text, &self.config.chunking);
        progress.report(LoadProgressEvent::Chunked {
            filename: filename.clone(),
            chunks: chunks.len() as u64,
        });

        let cache = EmbeddingCache::open(&dir.embeddings_db_path()).await?;
        let embedder =
            CacheBackedEmbedder::new(self.embeddings.clone(), cache, self.config.embedding.batch_size)
                .with_dims(self.config.embedding.dims);

        progress.report(LoadProgressEvent::Embedding {
            filename: filename.clone(),
            total: chunks.len() as u64,
        });
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = embedder.embed_documents(&texts).await?;
        progress.report(LoadProgressEvent::Ready {
            filename,
            computed: embedded.computed as u64,
            cached: embedded.cached as u64,
        });

        let chunk_count = chunks.len();
        let index = VectorIndex::build(chunks, embedded.vectors)?;
        let retriever = Retriever::new(
            embedder,
            index,
            self.chat.clone(),
            &self.config.retrieval,
        );
        Ok((retriever, chunk_count, embedded.computed, embedded.cached))
    }
}
