//! Boundary-preserving chunker.
//!
//! Sliding window over body text with recursive break-point search
//! (section break > paragraph > sentence > word); tables and captions are
//! emitted as atomic chunks and never split. Page and section attribution is
//! preserved per chunk, and `chunk_index` is the chunk's position within the
//! whole document.

use crate::config::ChunkingConfig;
use crate::processing::parser::ParsedSegment;

#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position within the document, in emission order.
    pub chunk_index: u32,
    pub page: u32,
    pub section: String,
    pub text: String,
    pub is_table: bool,
    pub is_caption: bool,
    pub heading_level: u8,
}

pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl TextChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap.min(config.chunk_size.saturating_sub(1)),
            min_chunk_size: config.min_chunk_size,
        }
    }

    /// Chunk a parsed document, keeping segment structure.
    pub fn chunk_document(&self, segments: &[ParsedSegment]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut index = 0u32;

        for segment in segments {
            // Headings become part of the section labels, not chunks.
            if segment.heading_level > 0 {
                continue;
            }

            let section = segment.section.clone().unwrap_or_default();

            if segment.is_table || segment.is_caption {
                let text = segment.text.trim();
                if text.is_empty() {
                    continue;
                }
                chunks.push(Chunk {
                    chunk_index: index,
                    page: segment.page,
                    section,
                    text: text.to_string(),
                    is_table: segment.is_table,
                    is_caption: segment.is_caption,
                    heading_level: 0,
                });
                index += 1;
                continue;
            }

            for piece in self.split_text(&segment.text) {
                chunks.push(Chunk {
                    chunk_index: index,
                    page: segment.page,
                    section: section.clone(),
                    text: piece,
                    is_table: false,
                    is_caption: false,
                    heading_level: 0,
                });
                index += 1;
            }
        }

        chunks
    }

    /// Sliding-window split of plain text.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if text.len() <= self.chunk_size {
            if text.len() < self.min_chunk_size {
                return Vec::new();
            }
            return vec![text.to_string()];
        }

        let mut pieces = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let raw_end = (start + self.chunk_size).min(text.len());
            let end = snap_to_char_boundary(text, raw_end);

            let actual_end = if end < text.len() {
                self.find_break_point(text, start, end)
            } else {
                end
            };

            let piece = text[start..actual_end].trim();
            if piece.len() >= self.min_chunk_size {
                pieces.push(piece.to_string());
            }

            // Move forward with overlap.
            let step = if actual_end - start > self.chunk_overlap {
                actual_end - start - self.chunk_overlap
            } else {
                actual_end - start
            };
            start = snap_to_char_boundary(text, start + step.max(1));
            if start >= text.len() {
                break;
            }
        }

        pieces
    }

    /// Find the best break near `preferred_end`, searching backwards within
    /// a window. Priority: section break > paragraph > sentence > word.
    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let window = 200;
        let raw_search_start = if preferred_end > start + window {
            preferred_end - window
        } else {
            start
        };
        let search_start = snap_to_char_boundary(text, raw_search_start);
        let safe_end = snap_to_char_boundary(text, preferred_end);

        if search_start >= safe_end {
            return safe_end;
        }

        let region = &text[search_start..safe_end];

        if let Some(pos) = region.rfind("\n\n\n") {
            return search_start + pos + 3;
        }
        if let Some(pos) = region.rfind("\n\n") {
            return search_start + pos + 2;
        }
        for sentence_end in [". ", ".\n", "! ", "? "] {
            if let Some(pos) = region.rfind(sentence_end) {
                return search_start + pos + sentence_end.len();
            }
        }
        if let Some(pos) = region.rfind('\n') {
            return search_start + pos + 1;
        }
        if let Some(pos) = region.rfind(' ') {
            return search_start + pos + 1;
        }

        safe_end
    }
}

/// Snap a byte offset down to the nearest UTF-8 char boundary.
fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}
