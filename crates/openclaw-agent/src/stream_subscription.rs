//! Converts provider streaming events into ordered text blocks without
//! duplication (§4.6).
//!
//! A [`StreamSubscription`] sits between [`crate::stream::StreamEvent`]
//! consumption and a reply dispatcher: it owns the running buffer and
//! decides when a block is "done" under one of two break modes, but it
//! never sends anything itself — callers drain [`StreamSubscription::feed`]
//! and forward the returned blocks to whatever sink they use (a WS
//! broadcast, a dispatcher queue, a test assertion).

use crate::stream::StreamEvent;

/// How the subscription decides block boundaries.
#[derive(Debug, Clone)]
pub enum BreakMode {
    /// Emit one block per `TextEnd` event, suppressing it if its content is
    /// exactly what the running buffer already holds.
    TextEnd,
    /// Accumulate deltas and emit as soon as the buffer both exceeds
    /// `min_chars` and contains a newline, or once it reaches `max_chars`
    /// regardless of break character.
    Chunked { min_chars: usize, max_chars: usize },
}

/// Converts one turn's stream into a sequence of non-overlapping text
/// blocks. One instance per in-flight turn.
pub struct StreamSubscription {
    mode: BreakMode,
    /// Text accumulated since the last emitted block (chunked mode) or
    /// since the stream began (text_end mode, for duplicate detection).
    buffer: String,
    /// Every character ever emitted as a block, in order — the invariant
    /// `assistantTexts == emitted` from §4.6 is this field.
    emitted: String,
}

impl StreamSubscription {
    pub fn new(mode: BreakMode) -> Self {
        Self { mode, buffer: String::new(), emitted: String::new() }
    }

    /// Total text emitted as blocks so far. Equals the textual prefix the
    /// subscription has handed off at any point, per the §4.6 invariant.
    pub fn assistant_texts(&self) -> &str {
        &self.emitted
    }

    /// Feed one stream event; returns the blocks (if any) this event
    /// caused to be emitted, in order.
    pub fn feed(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::TextDelta { text } => {
                self.buffer.push_str(text);
                match &self.mode {
                    BreakMode::TextEnd => Vec::new(),
                    BreakMode::Chunked { min_chars, max_chars } => {
                        self.drain_chunks(*min_chars, *max_chars)
                    }
                }
            }
            StreamEvent::TextEnd { text } => self.handle_text_end(text),
            // Thinking/ToolUse/Error/Done carry no block text of their own.
            StreamEvent::Thinking { .. }
            | StreamEvent::ToolUse { .. }
            | StreamEvent::Done { .. }
            | StreamEvent::Error { .. } => Vec::new(),
        }
    }

    /// Flush whatever remains in the buffer as a final block — called once
    /// the stream has ended with no further `TextEnd`/chunk boundary. A
    /// no-op if the buffer is empty or if it has already been emitted.
    pub fn finish(&mut self) -> Vec<String> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let block = std::mem::take(&mut self.buffer);
        self.emitted.push_str(&block);
        vec![block]
    }

    fn handle_text_end(&mut self, text: &str) -> Vec<String> {
        match &self.mode {
            BreakMode::TextEnd => {
                if text == self.buffer {
                    // Already holds exactly this content from prior deltas;
                    // nothing new to emit, but it still counts as emitted.
                    self.emitted.push_str(text);
                    self.buffer.clear();
                    Vec::new()
                } else {
                    self.emitted.push_str(text);
                    self.buffer.clear();
                    vec![text.to_string()]
                }
            }
            BreakMode::Chunked { .. } => {
                // Trailing text_end whose content matches what's already
                // been emitted (buffer + everything flushed so far):
                // suppress, per §4.6.
                if text == self.buffer {
                    self.emitted.push_str(&self.buffer);
                    self.buffer.clear();
                    Vec::new()
                } else if let Some(remainder) = text.strip_prefix(self.emitted.as_str()) {
                    if remainder == self.buffer {
                        self.emitted.push_str(&self.buffer);
                        self.buffer.clear();
                        Vec::new()
                    } else {
                        self.buffer = remainder.to_string();
                        self.finish()
                    }
                } else {
                    self.buffer = text.to_string();
                    self.finish()
                }
            }
        }
    }

    fn drain_chunks(&mut self, min_chars: usize, max_chars: usize) -> Vec<String> {
        let mut blocks = Vec::new();
        loop {
            if self.buffer.len() >= max_chars {
                let split_at = floor_char_boundary(&self.buffer, max_chars);
                let block: String = self.buffer.drain(..split_at).collect();
                self.emitted.push_str(&block);
                blocks.push(block);
                continue;
            }
            if self.buffer.len() >= min_chars {
                if let Some(break_at) = preferred_break(&self.buffer, min_chars) {
                    let block: String = self.buffer.drain(..break_at).collect();
                    self.emitted.push_str(&block);
                    blocks.push(block);
                    continue;
                }
            }
            break;
        }
        blocks
    }
}

/// Largest newline position at or after `min_chars`, taken as an exclusive
/// end index that includes the newline in the emitted block.
fn preferred_break(buffer: &str, min_chars: usize) -> Option<usize> {
    buffer[min_chars.min(buffer.len())..]
        .find('\n')
        .map(|rel| min_chars.min(buffer.len()) + rel + 1)
}

/// Largest char boundary `<= idx`, so splitting never panics mid-codepoint.
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut i = idx.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_end_matching_buffer_is_not_duplicated() {
        let mut sub = StreamSubscription::new(BreakMode::TextEnd);
        assert!(sub.feed(&StreamEvent::TextDelta { text: "hello ".into() }).is_empty());
        assert!(sub.feed(&StreamEvent::TextDelta { text: "world".into() }).is_empty());
        let blocks = sub.feed(&StreamEvent::TextEnd { text: "hello world".into() });
        assert!(blocks.is_empty());
        assert_eq!(sub.assistant_texts(), "hello world");
    }

    #[test]
    fn text_end_mode_emits_once_per_block() {
        let mut sub = StreamSubscription::new(BreakMode::TextEnd);
        sub.feed(&StreamEvent::TextDelta { text: "partial".into() });
        let blocks = sub.feed(&StreamEvent::TextEnd { text: "different content".into() });
        assert_eq!(blocks, vec!["different content".to_string()]);
    }

    #[test]
    fn chunked_mode_emits_at_newline_past_min_chars() {
        let mut sub = StreamSubscription::new(BreakMode::Chunked { min_chars: 5, max_chars: 100 });
        let blocks = sub.feed(&StreamEvent::TextDelta { text: "short\nmore text after".into() });
        assert_eq!(blocks, vec!["short\n".to_string()]);
        assert_eq!(sub.assistant_texts(), "short\n");
    }

    #[test]
    fn chunked_mode_force_emits_at_max_chars_without_newline() {
        let mut sub = StreamSubscription::new(BreakMode::Chunked { min_chars: 1000, max_chars: 10 });
        let blocks = sub.feed(&StreamEvent::TextDelta { text: "0123456789abcdef".into() });
        assert_eq!(blocks, vec!["0123456789".to_string()]);
    }

    #[test]
    fn chunked_trailing_text_end_matching_emitted_is_suppressed() {
        let mut sub = StreamSubscription::new(BreakMode::Chunked { min_chars: 5, max_chars: 100 });
        sub.feed(&StreamEvent::TextDelta { text: "short\ntail".into() });
        // "short\n" already emitted, "tail" sits in the buffer.
        let blocks = sub.feed(&StreamEvent::TextEnd { text: "short\ntail".into() });
        assert!(blocks.is_empty());
        assert_eq!(sub.assistant_texts(), "short\ntail");
    }

    #[test]
    fn no_two_emissions_overlap() {
        let mut sub = StreamSubscription::new(BreakMode::Chunked { min_chars: 4, max_chars: 8 });
        let mut all_blocks = Vec::new();
        for chunk in ["ab", "cd\n", "ef", "gh", "ij\n", "kl"] {
            all_blocks.extend(sub.feed(&StreamEvent::TextDelta { text: chunk.to_string() }));
        }
        all_blocks.extend(sub.finish());
        let joined: String = all_blocks.concat();
        assert_eq!(joined, "abcd\nefghij\nkl");
        assert_eq!(sub.assistant_texts(), joined);
    }
}
