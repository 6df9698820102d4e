//! Token estimation without a tokenizer dependency.
//!
//! CJK scripts (Hangul syllables, CJK ideographs, kana) tokenize around two
//! characters per token under common subword vocabularies; Latin text runs
//! around four. Good enough for context budgeting and usage accounting.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

pub(crate) fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{AC00}'..='\u{D7A3}'   // Hangul syllables
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{3040}'..='\u{30FF}' // Hiragana + Katakana
    )
}

/// Estimate the token count of `text`. Returns at least 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let mut cjk_chars = 0usize;
    let mut other_chars = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk_chars += 1;
        } else {
            other_chars += 1;
        }
    }

    let estimated = (cjk_chars as f64 / 2.0) + (other_chars as f64 / 4.0);
    (estimated as u64).max(1)
}

/// Estimate usage for a prompt/completion pair.
pub fn calculate_usage(input_text: &str, output_text: &str) -> TokenUsage {
    TokenUsage::new(estimate_tokens(input_text), estimate_tokens(output_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_latin_four_chars_per_token() {
        // 40 ASCII chars -> ~10 tokens
        let text = "a".repeat(40);
        assert_eq!(estimate_tokens(&text), 10);
    }

    #[test]
    fn test_cjk_two_chars_per_token() {
        let text = "그래프".repeat(10); // 30 Hangul syllables
        assert_eq!(estimate_tokens(&text), 15);
    }

    #[test]
    fn test_mixed_text() {
        // 8 latin (2 tokens) + 4 hangul (2 tokens)
        assert_eq!(estimate_tokens("abcdefgh급여지급"), 4);
    }

    #[test]
    fn test_nonempty_is_at_least_one() {
        assert_eq!(estimate_tokens("a"), 1);
    }

    #[test]
    fn test_usage_totals() {
        let usage = calculate_usage(&"x".repeat(400), &"y".repeat(40));
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 10);
        assert_eq!(usage.total_tokens, 110);
    }
}
