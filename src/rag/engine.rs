use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::ApiError;

/// Configuration for document chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Maximum chunk size in characters
    pub chunk_size: usize,
    /// Overlap between chunks
    pub chunk_overlap: usize,
    /// Maximum total chunks per source
    pub max_chunks: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            max_chunks: 200,
        }
    }
}

/// A text chunk with source information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    /// Source identifier (filename, etc.)
    pub source: String,
    /// Character offset in the original document
    pub start_offset: usize,
    pub chunk_index: usize,
}

/// Split text into overlapping chunks, trimming at sentence boundaries.
pub fn split_into_chunks(text: &str, source: &str, config: &RagConfig) -> Vec<TextChunk> {
    let chunk_size = config.chunk_size;
    let overlap = config.chunk_overlap;
    let max_chunks = config.max_chunks;

    let mut chunks = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let total_chars = chars.len();

    if total_chars == 0 {
        return chunks;
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut start = 0;
    let mut chunk_index = 0;

    while start < total_chars && chunks.len() < max_chunks {
        let end = (start + chunk_size).min(total_chars);
        let chunk_text: String = chars[start..end].iter().collect();

        let final_text = if end < total_chars {
            find_sentence_boundary(&chunk_text)
        } else {
            chunk_text
        };

        chunks.push(TextChunk {
            text: final_text.trim().to_string(),
            source: source.to_string(),
            start_offset: start,
            chunk_index,
        });

        start += step;
        chunk_index += 1;
    }

    chunks
}

/// Load and chunk every plain-text document (.txt, .md) in a directory.
///
/// PDF extraction is deliberately not handled; drop converted text files in
/// the directory instead.
pub fn load_documents_from_dir(dir: &Path, config: &RagConfig) -> Result<Vec<TextChunk>, ApiError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| ApiError::Internal(format!("cannot read {}: {}", dir.display(), err)))?;

    let mut chunks = Vec::new();
    for entry in entries {
        let entry = entry.map_err(ApiError::internal)?;
        let path = entry.path();
        let is_text = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("txt") | Some("md")
        );
        if !is_text {
            continue;
        }

        let source = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("document")
            .to_string();
        match std::fs::read_to_string(&path) {
            Ok(text) => chunks.extend(split_into_chunks(&text, &source, config)),
            Err(err) => {
                tracing::warn!("Skipping unreadable document {}: {}", path.display(), err);
            }
        }
    }

    Ok(chunks)
}

fn find_sentence_boundary(text: &str) -> String {
    let boundaries = ['.', '!', '?', '\n'];
    if let Some(pos) = text.rfind(|c| boundaries.contains(&c)) {
        // Keep the boundary character; avoid degenerate tiny chunks.
        if pos > text.len() / 2 {
            return text[..=pos].to_string();
        }
    }
    text.to_string()
}
