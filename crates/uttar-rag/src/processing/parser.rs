//! PDF text extraction with page attribution.
//!
//! lopdf drives the per-page pass so chunks keep page numbers; pdf_extract is
//! the fallback when content-stream parsing yields nothing (its output loses
//! page boundaries, so everything lands on page 1). Scanned/image PDFs have
//! no extractable text and are rejected as permanent failures. OCR is out of
//! scope.

use std::path::Path;

use lopdf::Document as LopdfDocument;

use crate::error::{RagError, Result};

/// One contiguous run of text with its page and detected structure.
#[derive(Debug, Clone)]
pub struct ParsedSegment {
    pub page: u32,
    /// Section heading in effect where this segment starts, if any.
    pub section: Option<String>,
    pub text: String,
    pub is_table: bool,
    pub is_caption: bool,
    /// 0 for body text, 1..=3 for headings.
    pub heading_level: u8,
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub page_count: u32,
    pub segments: Vec<ParsedSegment>,
}

impl ParsedDocument {
    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Parse a PDF from disk. CPU-bound; callers run it under `spawn_blocking`.
pub fn parse_pdf(path: &Path) -> Result<ParsedDocument> {
    let per_page = extract_pages_lopdf(path);

    let pages: Vec<(u32, String)> = match per_page {
        Ok(pages) if pages.iter().any(|(_, text)| !text.trim().is_empty()) => pages,
        _ => {
            // Content-stream parsing came up empty; fall back to pdf_extract.
            let text = pdf_extract::extract_text(path).map_err(|e| {
                RagError::Permanent(format!("unparseable PDF {}: {e}", path.display()))
            })?;
            if text.trim().is_empty() {
                return Err(RagError::Permanent(format!(
                    "PDF contains no extractable text (scanned/image-based): {}",
                    path.display()
                )));
            }
            vec![(1, text)]
        }
    };

    let page_count = pages.len() as u32;
    let mut segments = Vec::new();
    for (page, text) in &pages {
        segment_page(*page, text, &mut segments);
    }

    if segments.is_empty() {
        return Err(RagError::Permanent(format!(
            "PDF contains no extractable text (scanned/image-based): {}",
            path.display()
        )));
    }

    Ok(ParsedDocument {
        page_count,
        segments,
    })
}

fn extract_pages_lopdf(path: &Path) -> Result<Vec<(u32, String)>> {
    let doc = LopdfDocument::load(path)
        .map_err(|e| RagError::Permanent(format!("corrupt PDF {}: {e}", path.display())))?;

    let mut pages = Vec::new();
    for page_number in doc.get_pages().into_keys() {
        let text = doc.extract_text(&[page_number]).unwrap_or_default();
        pages.push((page_number, text));
    }
    pages.sort_by_key(|(n, _)| *n);
    Ok(pages)
}

/// Split page text into typed segments: headings, tables, captions, body.
/// Consecutive body lines merge into paragraph segments; the current heading
/// propagates as the section label.
fn segment_page(page: u32, text: &str, out: &mut Vec<ParsedSegment>) {
    let mut section: Option<String> = None;
    let mut body = String::new();

    let flush_body = |body: &mut String, section: &Option<String>, out: &mut Vec<ParsedSegment>| {
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            out.push(ParsedSegment {
                page,
                section: section.clone(),
                text: trimmed.to_string(),
                is_table: false,
                is_caption: false,
                heading_level: 0,
            });
        }
        body.clear();
    };

    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end();
        let trimmed = line.trim();

        if trimmed.is_empty() {
            body.push('\n');
            i += 1;
            continue;
        }

        if let Some(level) = heading_level(trimmed) {
            flush_body(&mut body, &section, out);
            section = Some(trimmed.trim_start_matches('#').trim().to_string());
            out.push(ParsedSegment {
                page,
                section: section.clone(),
                text: trimmed.to_string(),
                is_table: false,
                is_caption: false,
                heading_level: level,
            });
            i += 1;
            continue;
        }

        if is_table_line(trimmed) {
            flush_body(&mut body, &section, out);
            // Swallow the whole run of table lines as one atomic segment.
            let mut table = String::new();
            while i < lines.len() && is_table_line(lines[i].trim()) {
                table.push_str(lines[i].trim_end());
                table.push('\n');
                i += 1;
            }
            out.push(ParsedSegment {
                page,
                section: section.clone(),
                text: table.trim_end().to_string(),
                is_table: true,
                is_caption: false,
                heading_level: 0,
            });
            continue;
        }

        if is_caption_line(trimmed) {
            flush_body(&mut body, &section, out);
            out.push(ParsedSegment {
                page,
                section: section.clone(),
                text: trimmed.to_string(),
                is_table: false,
                is_caption: true,
                heading_level: 0,
            });
            i += 1;
            continue;
        }

        body.push_str(line);
        body.push('\n');
        i += 1;
    }

    flush_body(&mut body, &section, out);
}

/// Detect a heading: markdown hashes, or a short line in ALL CAPS / numbered
/// outline form ("3.2 Billing"). Returns the heading level.
fn heading_level(line: &str) -> Option<u8> {
    if let Some(stripped) = line.strip_prefix("###") {
        if stripped.starts_with(' ') {
            return Some(3);
        }
    }
    if let Some(stripped) = line.strip_prefix("##") {
        if stripped.starts_with(' ') {
            return Some(2);
        }
    }
    if let Some(stripped) = line.strip_prefix('#') {
        if stripped.starts_with(' ') {
            return Some(1);
        }
    }

    if line.len() <= 80 && !line.ends_with('.') {
        // "1. Overview" / "3.2 Billing" style
        let mut chars = line.chars();
        if chars.next().is_some_and(|c| c.is_ascii_digit())
            && line.contains(' ')
            && line
                .split_whitespace()
                .next()
                .is_some_and(|head| head.chars().all(|c| c.is_ascii_digit() || c == '.'))
        {
            return Some(2);
        }
        // ALL CAPS line of at least two words
        let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
        if letters.len() >= 6
            && letters.iter().all(|c| c.is_uppercase())
            && line.split_whitespace().count() >= 2
        {
            return Some(1);
        }
    }
    None
}

fn is_table_line(line: &str) -> bool {
    if line.starts_with('|') && line.ends_with('|') {
        return true;
    }
    // Tab-separated rows of 3+ cells
    line.matches('\t').count() >= 2
}

fn is_caption_line(line: &str) -> bool {
    let lowered = line.to_lowercase();
    (lowered.starts_with("figure ") || lowered.starts_with("table ") || lowered.starts_with("fig."))
        && line.len() <= 200
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments_for(text: &str) -> Vec<ParsedSegment> {
        let mut out = Vec::new();
        segment_page(1, text, &mut out);
        out
    }

    #[test]
    fn test_heading_detection() {
        assert_eq!(heading_level("# Introduction"), Some(1));
        assert_eq!(heading_level("## Billing Rules"), Some(2));
        assert_eq!(heading_level("3.2 Billing"), Some(2));
        assert_eq!(heading_level("TERMS AND CONDITIONS"), Some(1));
        assert_eq!(heading_level("A normal sentence that ends."), None);
    }

    #[test]
    fn test_table_is_atomic_segment() {
        let segments = segments_for("before\n| a | b |\n| 1 | 2 |\n| 3 | 4 |\nafter");
        let table: Vec<_> = segments.iter().filter(|s| s.is_table).collect();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].text.lines().count(), 3);
    }

    #[test]
    fn test_caption_detection() {
        let segments = segments_for("Figure 3: Photosynthesis overview\nBody text here.");
        assert!(segments[0].is_caption);
        assert!(!segments[1].is_caption);
    }

    #[test]
    fn test_section_propagates_to_body() {
        let segments = segments_for("# Energy\nPlants convert light.\n\n# Water\nRoots absorb water.");
        let bodies: Vec<_> = segments.iter().filter(|s| s.heading_level == 0).collect();
        assert_eq!(bodies[0].section.as_deref(), Some("Energy"));
        assert_eq!(bodies[1].section.as_deref(), Some("Water"));
    }

    #[test]
    fn test_empty_page_yields_nothing() {
        assert!(segments_for("   \n\n  ").is_empty());
    }
}
