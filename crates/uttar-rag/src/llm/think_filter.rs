//! Filtering of `<think>…</think>` reasoning blocks from model output.
//!
//! Some local models (qwen, phi families) emit chain-of-thought wrapped in
//! think tags, sometimes without the opening tag. The streaming filter drops
//! that content token-by-token while buffering just enough to catch tags
//! split across chunk boundaries; `clean_response` handles whole strings.

/// Remove think blocks from a complete response.
pub fn clean_response(text: &str) -> String {
    let mut text = text.to_string();

    // A closing tag without an opener means everything before it was thinking.
    if let Some(pos) = find_ci(&text, "</think>") {
        if find_ci(&text[..pos], "<think>").is_none() {
            text = text[pos + "</think>".len()..].to_string();
        }
    }

    // Remove complete blocks.
    loop {
        let Some(start) = find_ci(&text, "<think>") else { break };
        let Some(end_rel) = find_ci(&text[start..], "</think>") else {
            // Unterminated block: drop the rest.
            text.truncate(start);
            break;
        };
        let end = start + end_rel + "</think>".len();
        text.replace_range(start..end, "");
    }

    text.trim().to_string()
}

/// ASCII case-insensitive substring search. Byte offsets stay valid because
/// the needle is pure ASCII.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Real-time filter for streaming chunks. Keeps the full raw response so the
/// final persisted text can be cleaned in one pass.
pub struct StreamingThinkFilter {
    buffer: String,
    in_think: bool,
    full_response: String,
}

/// Longest partial tag we need to hold back: "</think>" minus one char.
const HOLDBACK: usize = 12;

impl Default for StreamingThinkFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingThinkFilter {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            in_think: false,
            full_response: String::new(),
        }
    }

    /// Process one streamed chunk, returning the displayable part.
    pub fn process_chunk(&mut self, chunk: &str) -> String {
        self.full_response.push_str(chunk);
        self.buffer.push_str(chunk);
        let mut output = String::new();

        loop {
            if self.in_think {
                if let Some(end) = find_ci(&self.buffer, "</think>") {
                    self.buffer.drain(..end + "</think>".len());
                    self.in_think = false;
                    continue;
                }
                // Keep only a tail large enough to detect a split "</think>".
                if self.buffer.len() > HOLDBACK {
                    let keep_from = floor_char_boundary(&self.buffer, self.buffer.len() - HOLDBACK);
                    self.buffer.drain(..keep_from);
                }
                break;
            }

            if let Some(start) = find_ci(&self.buffer, "<think>") {
                output.push_str(&self.buffer[..start]);
                self.buffer.drain(..start + "<think>".len());
                self.in_think = true;
                continue;
            }

            if let Some(idx) = self.buffer.rfind('<') {
                // Might be the start of a tag split across chunks.
                if self.buffer.len() - idx < HOLDBACK {
                    output.push_str(&self.buffer[..idx]);
                    self.buffer.drain(..idx);
                    break;
                }
            }

            output.push_str(&self.buffer);
            self.buffer.clear();
            break;
        }

        output
    }

    /// Flush whatever remains after the stream ends.
    pub fn flush(&mut self) -> String {
        if self.in_think {
            self.buffer.clear();
            return String::new();
        }
        std::mem::take(&mut self.buffer)
    }

    /// Full response with think blocks removed, for persistence.
    pub fn clean_full_response(&self) -> String {
        clean_response(&self.full_response)
    }
}

fn floor_char_boundary(s: &str, mut pos: usize) -> usize {
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_chunks(chunks: &[&str]) -> (String, String) {
        let mut filter = StreamingThinkFilter::new();
        let mut streamed = String::new();
        for chunk in chunks {
            streamed.push_str(&filter.process_chunk(chunk));
        }
        streamed.push_str(&filter.flush());
        (streamed, filter.clean_full_response())
    }

    #[test]
    fn test_passthrough_without_tags() {
        let (streamed, cleaned) = run_chunks(&["Hello ", "world"]);
        assert_eq!(streamed, "Hello world");
        assert_eq!(cleaned, "Hello world");
    }

    #[test]
    fn test_drops_think_block() {
        let (streamed, _) = run_chunks(&["<think>reasoning here</think>", "Answer"]);
        assert_eq!(streamed, "Answer");
    }

    #[test]
    fn test_tag_split_across_chunks() {
        let (streamed, _) = run_chunks(&["before<th", "ink>hidden</th", "ink>after"]);
        assert_eq!(streamed, "beforeafter");
    }

    #[test]
    fn test_closing_tag_without_opener() {
        assert_eq!(clean_response("some thoughts</think>\nThe answer"), "The answer");
    }

    #[test]
    fn test_unterminated_block_is_dropped() {
        let (streamed, cleaned) = run_chunks(&["Answer<think>never ends"]);
        assert_eq!(streamed, "Answer");
        assert_eq!(cleaned, "Answer");
    }

    #[test]
    fn test_case_insensitive_tags() {
        assert_eq!(clean_response("<THINK>x</THINK>ok"), "ok");
    }

    #[test]
    fn test_angle_bracket_not_a_tag() {
        let (streamed, _) = run_chunks(&["a < b and a <b> c"]);
        assert_eq!(streamed, "a < b and a <b> c");
    }
}
