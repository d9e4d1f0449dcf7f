//! Separator-aware text chunker with fixed overlap.
//!
//! Splits extracted document text into [`Chunk`]s of at most `chunk_size`
//! characters. Each cut is placed just after the last `separator` inside the
//! window when one exists, otherwise at the window edge. The next chunk
//! starts `chunk_overlap` characters before the previous cut, so adjacent
//! chunks share exactly that much source text.
//!
//! Sizes are counted in `char`s; cuts never split a UTF-8 sequence. Each
//! chunk records its byte span in the source and a SHA-256 hash of its text,
//! which the embedding cache uses as its key.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Split `text` using the configured separator, size and overlap.
pub fn chunk_document(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    chunk_text(
        text,
        &config.separator,
        config.chunk_size,
        config.chunk_overlap,
    )
}

/// Split text into overlapping chunks. Returns chunks with contiguous
/// indices starting at 0; empty or whitespace-only text yields none.
///
/// `chunk_overlap` must be smaller than `chunk_size` (enforced by config
/// validation); a larger value is clamped to `chunk_size - 1`.
pub fn chunk_text(
    text: &str,
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Chunk> {
    if text.trim().is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let overlap = chunk_overlap.min(chunk_size - 1);

    // offsets[k] is the byte offset of char k; the final entry is text.len().
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = offsets.len() - 1;

    // Char positions immediately after each separator occurrence.
    let cut_points: Vec<usize> = if separator.is_empty() {
        Vec::new()
    } else {
        text.match_indices(separator)
            .filter_map(|(i, s)| offsets.binary_search(&(i + s.len())).ok())
            .collect()
    };

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        if char_len - start <= chunk_size {
            chunks.push(make_chunk(chunks.len(), text, offsets[start], text.len()));
            break;
        }

        let window_end = start + chunk_size;
        let fitting = cut_points.partition_point(|&p| p <= window_end);
        let end = match fitting.checked_sub(1).map(|i| cut_points[i]) {
            // The cut must leave progress beyond the overlap.
            Some(p) if p > start + overlap => p,
            _ => window_end,
        };

        chunks.push(make_chunk(chunks.len(), text, offsets[start], offsets[end]));
        start = end - overlap;
    }

    chunks
}

fn make_chunk(index: usize, source: &str, start: usize, end: usize) -> Chunk {
    let text = &source[start..end];
    Chunk {
        chunk_index: index,
        start,
        end,
        text: text.to_string(),
        hash: content_hash(text),
    }
}

/// Hex-encoded SHA-256 of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
