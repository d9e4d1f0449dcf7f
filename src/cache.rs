//! Local document cache and the cache-backed embedder.
//!
//! Layout under the configured cache root:
//!
//! ```text
//! <root>/<namespace>/<filename>/
//!     <filename>          raw uploaded bytes
//!     embeddings.sqlite   one row per (model, chunk text)
//! ```
//!
//! The namespace is the user or session identity, so two users uploading the
//! same filename never share a directory. Cache rows are keyed by
//! `sha256(model) ":" sha256(text)`; a text already present for the model is
//! never sent to the provider again.

use anyhow::{bail, Context, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chunk::content_hash;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};

const EMBEDDINGS_DB: &str = "embeddings.sqlite";

/// Per-document directory inside the cache root.
#[derive(Debug, Clone)]
pub struct DocumentDir {
    dir: PathBuf,
    filename: String,
}

impl DocumentDir {
    /// Resolve the directory for `filename` under `root/namespace`.
    ///
    /// Only the final path component of `filename` is used.
    pub fn new(root: &Path, namespace: &str, filename: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        let filename = sanitize_filename(filename)?;
        Ok(Self {
            dir: root.join(namespace).join(&filename),
            filename,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn raw_file_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }

    pub fn embeddings_db_path(&self) -> PathBuf {
        self.dir.join(EMBEDDINGS_DB)
    }

    /// Whether this document has been processed before.
    pub fn exists(&self) -> bool {
        self.embeddings_db_path().exists()
    }

    /// Create the directory and write the raw upload, replacing any previous copy.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create cache dir: {}", self.dir.display()))?;
        let path = self.raw_file_path();
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Namespaces become directory names: letters, digits, `-`, `_` and `.` only.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace != "."
        && namespace != ".."
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        bail!(
            "invalid namespace '{}': use letters, digits, '-', '_' or '.'",
            namespace
        );
    }
    Ok(())
}

/// Reduce an uploaded filename to a safe single path component.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    let name = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    if name.is_empty() || name == "." || name == ".." || name == EMBEDDINGS_DB {
        bail!("invalid filename '{}'", filename);
    }
    Ok(name.to_string())
}

/// Cache key for one (model, text) pair.
pub fn cache_key(model: &str, text: &str) -> String {
    format!("{}:{}", content_hash(model), content_hash(text))
}

/// Durable vector store backed by one SQLite file.
pub struct EmbeddingCache {
    pool: SqlitePool,
}

impl EmbeddingCache {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = db::connect(db_path)
            .await
            .with_context(|| format!("Failed to open embedding cache: {}", db_path.display()))?;
        Ok(Self { pool })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query("SELECT vector FROM embeddings WHERE cache_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("vector");
            embedding::blob_to_vec(&blob)
        }))
    }

    /// Store all entries in one transaction; either every row lands or none.
    pub async fn put_many(&self, model: &str, entries: &[(String, String, Vec<f32>)]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (key, text_hash, vector) in entries {
            sqlx::query(
                "INSERT INTO embeddings (cache_key, model, content_hash, dims, vector, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    dims = excluded.dims,
                    vector = excluded.vector,
                    created_at = excluded.created_at",
            )
            .bind(key)
            .bind(model)
            .bind(text_hash)
            .bind(vector.len() as i64)
            .bind(embedding::vec_to_blob(vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Result of embedding a document's chunks through the cache.
#[derive(Debug)]
pub struct CachedEmbeddings {
    /// One vector per input text, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Distinct texts sent to the provider.
    pub computed: usize,
    /// Inputs served from the cache.
    pub cached: usize,
}

/// Wraps an [`EmbeddingProvider`] with an [`EmbeddingCache`].
///
/// Document texts are cached; queries pass straight through to the provider.
pub struct CacheBackedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    batch_size: usize,
    dims: Option<usize>,
}

impl CacheBackedEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: EmbeddingCache, batch_size: usize) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            dims: None,
        }
    }

    /// Reject computed vectors whose length is not `dims`.
    pub fn with_dims(mut self, dims: Option<usize>) -> Self {
        self.dims = dims;
        self
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Embed document texts, computing only what the cache lacks.
    ///
    /// Missing vectors are written only after every provider call succeeded,
    /// so a failure leaves the cache exactly as it was.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<CachedEmbeddings> {
        let model = self.provider.model_name().to_string();
        let keys: Vec<String> = texts.iter().map(|t| cache_key(&model, t)).collect();

        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut cached = 0usize;
        // key -> position in `missing`, so duplicate texts are embedded once
        let mut missing_pos: HashMap<&str, usize> = HashMap::new();
        let mut missing: Vec<usize> = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            match self.cache.get(key).await? {
                Some(v) => {
                    cached += 1;
                    vectors.push(Some(v));
                }
                None => {
                    if !missing_pos.contains_key(key.as_str()) {
                        missing_pos.insert(key.as_str(), missing.len());
                        missing.push(i);
                    }
                    vectors.push(None);
                }
            }
        }

        let mut computed: Vec<Vec<f32>> = Vec::with_capacity(missing.len());
        for batch in missing.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let batch_vectors = self
                .provider
                .embed(&batch_texts)
                .await
                .with_context(|| format!("embedding model '{}' failed", model))?;
            if batch_vectors.len() != batch_texts.len() {
                bail!(
                    "embedding model '{}' returned {} vectors for {} texts",
                    model,
                    batch_vectors.len(),
                    batch_texts.len()
                );
            }
            if let Some(dims) = self.dims {
                if let Some(bad) = batch_vectors.iter().find(|v| v.len() != dims) {
                    bail!(
                        "embedding model '{}' returned {}-dimensional vectors, expected {}",
                        model,
                        bad.len(),
                        dims
                    );
                }
            }
            computed.extend(batch_vectors);
        }

        if !computed.is_empty() {
            let entries: Vec<(String, String, Vec<f32>)> = missing
                .iter()
                .zip(computed.iter())
                .map(|(&i, v)| (keys[i].clone(), content_hash(&texts[i]), v.clone()))
                .collect();
            self.cache.put_many(&model, &entries).await?;
            tracing::debug!(model = %model, count = entries.len(), "cached new embeddings");
        }

        let vectors = vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| match v {
                Some(v) => v,
                None => computed[missing_pos[keys[i].as_str()]].clone(),
            })
            .collect();

        Ok(CachedEmbeddings {
            vectors,
            computed: computed.len(),
            cached,
        })
    }

    /// Embed a query. Queries are not cached.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.provider.embed_query(text).await
    }
}
