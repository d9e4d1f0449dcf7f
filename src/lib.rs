//! # DocGPT
//!
//! Chat with a single uploaded document.
//!
//! A PDF, DOCX, or text file is split into overlapping chunks, embedded
//! through an on-disk cache, and indexed in memory. Each question is expanded
//! into paraphrases, the merged retrieval results become the context of a
//! fixed consultation persona, and the answer streams back fragment by
//! fragment while the conversation is recorded.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Extract  │──▶│  Chunk  │──▶│ Cache+Embed  │──▶│ VectorIndex │
//! │ pdf/docx │   │ overlap │   │   SQLite     │   │   cosine    │
//! └──────────┘   └─────────┘   └──────────────┘   └──────┬──────┘
//!       │                                                │
//!       ▼                                                ▼
//! ┌──────────┐                         ┌──────────────────────────┐
//! │ Archive  │                         │ Retriever ▶ Answer stream│
//! │  S3/GCS  │                         │  (multi-query)  (SSE)    │
//! └──────────┘                         └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction from PDF, DOCX, TXT |
//! | [`chunk`] | Separator-aware chunking with overlap |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`cache`] | Per-document cache directory and embedding cache |
//! | [`index`] | In-memory cosine similarity index |
//! | [`llm`] | Chat model client with token streaming |
//! | [`prompt`] | Persona, paraphrase, and fallback prompts |
//! | [`retriever`] | Query expansion and merged retrieval |
//! | [`answer`] | Answer streaming and transcript recording |
//! | [`archive`] | Remote archival of uploads |
//! | [`pipeline`] | Document loading |
//! | [`session`] | Per-user conversation state |
//! | [`server`] | HTTP chat server |
//! | [`db`] | Database connection |

pub mod answer;
pub mod archive;
pub mod cache;
pub mod chat_cmd;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod retriever;
pub mod server;
pub mod session;
