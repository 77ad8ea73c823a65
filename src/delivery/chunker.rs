//! Message splitting.
//!
//! Splitting is eager: the full fragment list is known before anything goes on
//! the air, so every chunk record can carry `total_chunks` from the start.
//! All sizes are UTF-8 byte lengths and no fragment boundary ever falls inside
//! a codepoint.

/// True when `text` is longer than the split threshold.
pub fn should_split(text: &str, payload_budget: usize) -> bool {
    text.len() > payload_budget
}

/// Pack whitespace-delimited tokens into fragments of at most `content_budget`
/// bytes. Separators stay attached to the token before them, so joining the
/// fragments reproduces `text` exactly. A token longer than the budget is cut
/// at the last char boundary that fits.
pub fn split(text: &str, content_budget: usize) -> Vec<String> {
    let budget = content_budget.max(1);
    if text.len() <= budget {
        return vec![text.to_string()];
    }

    let mut fragments = Vec::new();
    let mut current = String::new();
    for token in text.split_inclusive(char::is_whitespace) {
        if current.len() + token.len() <= budget {
            current.push_str(token);
            continue;
        }
        if !current.is_empty() {
            fragments.push(std::mem::take(&mut current));
        }
        if token.len() <= budget {
            current.push_str(token);
            continue;
        }
        // Oversized token: emit full slices, keep the tail open for packing.
        let mut rest = token;
        while rest.len() > budget {
            let cut = char_floor(rest, budget);
            fragments.push(rest[..cut].to_string());
            rest = &rest[cut..];
        }
        current.push_str(rest);
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

/// Largest char boundary `<= max` that still makes progress. When the first
/// char alone exceeds `max` it is taken whole.
fn char_floor(s: &str, max: usize) -> usize {
    let mut cut = max.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 {
        cut = s.chars().next().map(char::len_utf8).unwrap_or(s.len());
    }
    cut
}

/// What the outbound engine should do with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Short enough to go out as raw text with no frame envelope.
    Unframed(String),
    /// Needs the chunk protocol. `truncated_bytes` counts content dropped by
    /// the chunk-count cap.
    Framed {
        fragments: Vec<String>,
        truncated_bytes: usize,
    },
}

/// Splitting policy bound to the configured limits.
#[derive(Debug, Clone)]
pub struct Chunker {
    split_threshold: usize,
    content_budget: usize,
    max_chunks: usize,
}

impl Chunker {
    pub fn new(split_threshold: usize, content_budget: usize, max_chunks: usize) -> Self {
        Self {
            split_threshold,
            content_budget: content_budget.max(1),
            max_chunks: max_chunks.max(1),
        }
    }

    pub fn should_split(&self, text: &str) -> bool {
        should_split(text, self.split_threshold)
    }

    pub fn plan(&self, text: &str) -> SplitOutcome {
        if !self.should_split(text) {
            return SplitOutcome::Unframed(text.to_string());
        }
        let mut fragments = split(text, self.content_budget);
        let truncated_bytes = if fragments.len() > self.max_chunks {
            fragments
                .drain(self.max_chunks..)
                .map(|dropped| dropped.len())
                .sum()
        } else {
            0
        };
        SplitOutcome::Framed {
            fragments,
            truncated_bytes,
        }
    }
}
