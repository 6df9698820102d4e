//! PDF parsing and chunking.

pub mod chunker;
pub mod parser;

pub use chunker::{Chunk, TextChunker};
pub use parser::{parse_pdf, ParsedDocument, ParsedSegment};
