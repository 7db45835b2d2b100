//! Incremental delta reconstruction for cumulative streaming payloads
//!
//! Some vendors resend the full accumulated text (and running token counts)
//! on every streamed frame rather than true increments. The state here turns
//! those into strictly incremental deltas. Payload schemas guarantee prefix
//! stability: each cumulative frame begins with the previous one.

use crate::chat::Usage;
use tracing::warn;

/// Per-turn cumulative text state.
#[derive(Debug, Default)]
pub struct CumulativeText {
    previous: String,
}

impl CumulativeText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suffix of `current` beyond the previously observed text.
    ///
    /// Returns `None` when the frame carries nothing new. A frame that does
    /// not extend the previous text violates prefix stability; that is
    /// flagged and the length-based suffix is still taken, so concatenated
    /// deltas stay deterministic.
    pub fn delta(&mut self, current: &str) -> Option<String> {
        if !current.starts_with(self.previous.as_str()) {
            warn!(
                previous_len = self.previous.len(),
                current_len = current.len(),
                "cumulative payload does not extend the previous frame"
            );
        }
        let start = self.previous.len().min(current.len());
        let delta = current.get(start..).unwrap_or_default().to_string();
        self.previous = current.to_string();
        if delta.is_empty() { None } else { Some(delta) }
    }
}

/// Per-turn cumulative usage state.
#[derive(Debug, Default)]
pub struct CumulativeUsage {
    previous: Usage,
}

impl CumulativeUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage consumed since the previous frame.
    pub fn delta(&mut self, current: Usage) -> Usage {
        let delta = Usage {
            prompt_tokens: current
                .prompt_tokens
                .saturating_sub(self.previous.prompt_tokens),
            completion_tokens: current
                .completion_tokens
                .saturating_sub(self.previous.completion_tokens),
            total_tokens: current
                .total_tokens
                .saturating_sub(self.previous.total_tokens),
        };
        self.previous = current;
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_deltas() {
        let mut state = CumulativeText::new();
        assert_eq!(state.delta("Hi"), Some("Hi".to_string()));
        assert_eq!(state.delta("Hi there"), Some(" there".to_string()));
        assert_eq!(state.delta("Hi there!"), Some("!".to_string()));
    }

    #[test]
    fn repeated_frame_yields_nothing() {
        let mut state = CumulativeText::new();
        assert_eq!(state.delta("Hello"), Some("Hello".to_string()));
        assert_eq!(state.delta("Hello"), None);
    }

    #[test]
    fn concatenated_deltas_reconstruct_final_text() {
        let frames = ["T", "Th", "The", "The qu", "The quick", "The quick fox"];
        let mut state = CumulativeText::new();
        let mut rebuilt = String::new();
        for frame in frames {
            if let Some(delta) = state.delta(frame) {
                rebuilt.push_str(&delta);
            }
        }
        assert_eq!(rebuilt, "The quick fox");
    }

    #[test]
    fn prefix_violation_is_length_based() {
        let mut state = CumulativeText::new();
        state.delta("Hello world");
        // Earlier text was edited; the suffix past the previous length is
        // still taken.
        assert_eq!(state.delta("HELLO world!!"), Some("!!".to_string()));
    }

    #[test]
    fn shrinking_frame_yields_nothing() {
        let mut state = CumulativeText::new();
        state.delta("Hello world");
        assert_eq!(state.delta("Hello"), None);
    }

    #[test]
    fn multibyte_text_deltas() {
        let mut state = CumulativeText::new();
        assert_eq!(state.delta("你好"), Some("你好".to_string()));
        assert_eq!(state.delta("你好，世界"), Some("，世界".to_string()));
    }

    #[test]
    fn usage_deltas_subtract() {
        let mut state = CumulativeUsage::new();
        let first = state.delta(Usage::of(10, 3));
        assert_eq!(first, Usage::of(10, 3));

        let second = state.delta(Usage {
            prompt_tokens: 10,
            completion_tokens: 8,
            total_tokens: 18,
        });
        assert_eq!(second.prompt_tokens, 0);
        assert_eq!(second.completion_tokens, 5);
        assert_eq!(second.total_tokens, 5);
    }

    #[test]
    fn usage_delta_never_underflows() {
        let mut state = CumulativeUsage::new();
        state.delta(Usage::of(10, 10));
        let next = state.delta(Usage::of(1, 1));
        assert_eq!(next, Usage::default());
    }
}
