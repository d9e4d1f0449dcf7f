//! TOML configuration.
//!
//! Every section except `[cache]` has defaults, so a minimal config file is:
//!
//! ```toml
//! [cache]
//! root = "./.cache"
//! ```
//!
//! Providers are selected by name. API keys are never read from the file;
//! they come from the environment (`OPENAI_API_KEY`, `ARCHIVE_*`).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Per-document directories are created under `<root>/<namespace>/<filename>/`.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_separator() -> String {
    "\n".to_string()
}
fn default_chunk_size() -> usize {
    2400
}
fn default_chunk_overlap() -> usize {
    400
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Chunks fetched from the index per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Paraphrases requested from the chat model per question.
    #[serde(default = "default_query_count")]
    pub query_count: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            query_count: default_query_count(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_query_count() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Expected vector length. When set, a provider returning any other
    /// length fails the load before anything is cached.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| match self.provider.as_str() {
            "ollama" => "nomic-embed-text".to_string(),
            "local" => "all-minilm-l6-v2".to_string(),
            _ => "text-embedding-ada-002".to_string(),
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request timeout. Streamed answers may run longer; for them it
    /// bounds the gap between two chunks instead.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL of an OpenAI-compatible API. Defaults to `https://api.openai.com`.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: default_chat_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_chat_provider() -> String {
    "openai".to_string()
}
fn default_chat_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f32 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_provider")]
    pub provider: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Host of the S3-compatible endpoint. Defaults to the Google Cloud Storage
    /// interoperability API.
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            provider: default_archive_provider(),
            bucket: None,
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_archive_provider() -> String {
    "disabled".to_string()
}
fn default_region() -> String {
    "auto".to_string()
}

impl ArchiveConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

impl Config {
    /// Configuration with every default and the given cache root.
    pub fn with_cache_root(root: impl Into<PathBuf>) -> Self {
        Self {
            cache: CacheConfig { root: root.into() },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            chat: ChatConfig::default(),
            archive: ArchiveConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }
    if config.chunking.separator.is_empty() {
        anyhow::bail!("chunking.separator must not be empty");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be >= 1 when set");
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or local.",
            other
        ),
    }

    match config.chat.provider.as_str() {
        "openai" => {}
        other => anyhow::bail!("Unknown chat provider: '{}'. Must be openai.", other),
    }
    if config.chat.timeout_secs == 0 {
        anyhow::bail!("chat.timeout_secs must be >= 1");
    }
    if !(0.0..=2.0).contains(&config.chat.temperature) {
        anyhow::bail!("chat.temperature must be in [0.0, 2.0]");
    }

    match config.archive.provider.as_str() {
        "disabled" => {}
        "s3" | "gcs" => {
            if config.archive.bucket.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!(
                    "archive.bucket must be set when provider is '{}'",
                    config.archive.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown archive provider: '{}'. Must be disabled, s3, or gcs.",
            other
        ),
    }

    Ok(())
}
