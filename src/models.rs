//! Core data models used throughout DocGPT.
//!
//! These types represent the uploaded document, its chunks, retrieved
//! context, and the conversation transcript that flow through the
//! question-answering pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw uploaded file. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// Lowercased extension without the dot, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.filename.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                Some(ext.to_ascii_lowercase())
            }
            _ => None,
        }
    }
}

/// A contiguous span of a document's extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the document's chunk sequence, starting at 0.
    pub chunk_index: usize,
    /// Byte offset of the first character in the extracted text.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    pub text: String,
    /// SHA-256 of `text`, hex-encoded.
    pub hash: String,
}

/// A chunk returned from the vector index with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Deduplicated chunks retrieved for one question, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub chunks: Vec<Chunk>,
    /// Every query that was run against the index, original first.
    pub queries: Vec<String>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk texts joined by blank lines, as substituted into the prompt.
    pub fn format(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Human => write!(f, "human"),
            Role::Ai => write!(f, "ai"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub message: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(i: usize, text: &str) -> Chunk {
        Chunk {
            chunk_index: i,
            start: 0,
            end: text.len(),
            text: text.to_string(),
            hash: String::new(),
        }
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(
            UploadedFile::new("Report.PDF", vec![]).extension().as_deref(),
            Some("pdf")
        );
        assert_eq!(UploadedFile::new("notes", vec![]).extension(), None);
        assert_eq!(UploadedFile::new(".bashrc", vec![]).extension(), None);
    }

    #[test]
    fn context_format_joins_with_blank_lines() {
        let ctx = RetrievedContext {
            chunks: vec![chunk(0, "one"), chunk(1, "two")],
            queries: vec![],
        };
        assert_eq!(ctx.format(), "one\n\ntwo");
    }

    #[test]
    fn role_serializes_lowercase() {
        let entry = TranscriptEntry {
            message: "hi".to_string(),
            role: Role::Ai,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"message":"hi","role":"ai"}"#);
    }
}
