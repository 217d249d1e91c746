//! Thinking-token post-processor.
//!
//! Several providers interleave reasoning traces into the visible content
//! stream, delimited by paired markers (`<think>…</think>`,
//! `[think]…[/think]`, `◁think▷…◁/think▷`). The proxy removes these before
//! the bytes reach the client: buffered responses are rewritten whole,
//! streaming responses per delta — with a carry-over tail so a delimiter
//! split across two SSE chunks is still recognized.
//!
//! When the configured delimiter set is empty the stripper is the identity.

/// Paired delimiters recognized by default.
const DEFAULT_DELIMITERS: &[(&str, &str)] = &[
    ("<think>", "</think>"),
    ("[think]", "[/think]"),
    ("◁think▷", "◁/think▷"),
];

/// Stateful stripper for one response stream.
///
/// Feed delta text through [`strip_chunk`][Self::strip_chunk] in arrival
/// order, then call [`finish`][Self::finish] at stream end to flush any
/// withheld tail.
pub struct ThinkingStripper {
    delimiters: Vec<(String, String)>,
    /// Withheld tail that might be the start of a delimiter.
    carry: String,
    /// Index into `delimiters` of the block we are currently inside.
    inside: Option<usize>,
}

impl Default for ThinkingStripper {
    fn default() -> Self {
        Self::new(
            DEFAULT_DELIMITERS
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        )
    }
}

impl ThinkingStripper {
    pub fn new(delimiters: Vec<(String, String)>) -> Self {
        Self { delimiters, carry: String::new(), inside: None }
    }

    /// Strip a complete text in one pass (buffered responses).
    pub fn strip_complete(text: &str) -> String {
        let mut stripper = Self::default();
        let mut out = stripper.strip_chunk(text);
        out.push_str(&stripper.finish());
        out
    }

    /// Process one streaming delta, returning the text safe to emit now.
    pub fn strip_chunk(&mut self, text: &str) -> String {
        if self.delimiters.is_empty() {
            return text.to_string();
        }

        let mut input = std::mem::take(&mut self.carry);
        input.push_str(text);

        let mut out = String::new();
        loop {
            match self.inside {
                Some(idx) => {
                    let end = &self.delimiters[idx].1;
                    match input.find(end.as_str()) {
                        Some(pos) => {
                            // Block closed: drop it and keep scanning after.
                            input = input[pos + end.len()..].to_string();
                            self.inside = None;
                        }
                        None => {
                            // Still inside. Keep only the tail that could be
                            // the start of the end marker.
                            self.carry = partial_suffix(&input, end);
                            return out;
                        }
                    }
                }
                None => {
                    match self.earliest_start(&input) {
                        Some((pos, idx, start_len)) => {
                            out.push_str(&input[..pos]);
                            input = input[pos + start_len..].to_string();
                            self.inside = Some(idx);
                        }
                        None => {
                            // No full start marker. Withhold any suffix that
                            // is a prefix of one, emit the rest.
                            let hold = self.longest_possible_prefix(&input);
                            let emit_to = input.len() - hold;
                            out.push_str(&input[..emit_to]);
                            self.carry = input[emit_to..].to_string();
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush at stream end. Text withheld inside an unterminated block is
    /// dropped; a withheld partial start marker was real content after all.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        if self.inside.is_some() {
            self.inside = None;
            String::new()
        } else {
            carry
        }
    }

    /// Position of the first full start delimiter in `input`.
    fn earliest_start(&self, input: &str) -> Option<(usize, usize, usize)> {
        self.delimiters
            .iter()
            .enumerate()
            .filter_map(|(idx, (start, _))| {
                input.find(start.as_str()).map(|pos| (pos, idx, start.len()))
            })
            .min_by_key(|(pos, _, _)| *pos)
    }

    /// Length in bytes of the longest input suffix that is a proper prefix
    /// of any start delimiter.
    fn longest_possible_prefix(&self, input: &str) -> usize {
        let mut longest = 0;
        for (start, _) in &self.delimiters {
            longest = longest.max(partial_suffix(input, start).len());
        }
        longest
    }
}

/// Longest suffix of `input` that is a proper prefix of `marker`.
fn partial_suffix(input: &str, marker: &str) -> String {
    // Suffixes shorter than the full marker only.
    let max = marker.len().saturating_sub(1).min(input.len());
    for take in (1..=max).rev() {
        if !input.is_char_boundary(input.len() - take) {
            continue;
        }
        let suffix = &input[input.len() - take..];
        if marker.starts_with(suffix) {
            return suffix.to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Whole-text stripping
    // -----------------------------------------------------------------------

    #[test]
    fn strips_a_simple_block() {
        assert_eq!(
            ThinkingStripper::strip_complete("before <think>hidden</think>after"),
            "before after"
        );
    }

    #[test]
    fn strips_multiple_blocks_and_styles() {
        let text = "<think>a</think>one [think]b[/think]two ◁think▷c◁/think▷three";
        assert_eq!(ThinkingStripper::strip_complete(text), "one two three");
    }

    #[test]
    fn text_without_delimiters_is_identity() {
        let text = "plain content with < and > but no markers";
        assert_eq!(ThinkingStripper::strip_complete(text), text);
    }

    #[test]
    fn unterminated_block_is_dropped() {
        assert_eq!(
            ThinkingStripper::strip_complete("visible <think>never closed"),
            "visible "
        );
    }

    #[test]
    fn empty_delimiter_set_is_identity() {
        let mut stripper = ThinkingStripper::new(vec![]);
        assert_eq!(stripper.strip_chunk("<think>kept</think>"), "<think>kept</think>");
        assert_eq!(stripper.finish(), "");
    }

    // -----------------------------------------------------------------------
    // Streaming: delimiters straddling chunk boundaries
    // -----------------------------------------------------------------------

    fn stream(chunks: &[&str]) -> String {
        let mut stripper = ThinkingStripper::default();
        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&stripper.strip_chunk(chunk));
        }
        out.push_str(&stripper.finish());
        out
    }

    #[test]
    fn start_marker_split_across_chunks() {
        assert_eq!(stream(&["hello <th", "ink>secret</think> world"]), "hello  world");
    }

    #[test]
    fn end_marker_split_across_chunks() {
        assert_eq!(stream(&["a<think>secret</th", "ink>b"]), "ab");
    }

    #[test]
    fn marker_split_one_byte_per_chunk() {
        let chunks: Vec<String> =
            "x<think>hidden</think>y".chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        assert_eq!(stream(&refs), "xy");
    }

    #[test]
    fn false_start_is_flushed_at_stream_end() {
        // "<th" looks like a marker prefix and must be withheld, then
        // surfaced once the stream ends without completing it.
        assert_eq!(stream(&["value is a<th"]), "value is a<th");
    }

    #[test]
    fn false_start_is_flushed_when_disambiguated() {
        assert_eq!(stream(&["a<th", "ree>b"]), "a<three>b");
    }

    #[test]
    fn withheld_prefix_does_not_duplicate_output() {
        // The "<" is withheld after chunk one, emitted in chunk two's pass.
        assert_eq!(stream(&["abc<", "def"]), "abc<def");
    }

    #[test]
    fn content_between_split_blocks_survives() {
        assert_eq!(
            stream(&["one<think>x", "y</think>two<think>", "z</think>three"]),
            "onetwothree"
        );
    }

    #[test]
    fn multibyte_delimiters_split_across_chunks() {
        // ◁ is a 3-byte code point; split inside the marker, not the char.
        assert_eq!(stream(&["a◁think▷hidden◁/think", "▷b"]), "ab");
    }
}
