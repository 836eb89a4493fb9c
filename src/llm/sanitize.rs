//! Visible-text sanitizer for streamed completions.
//!
//! Raw model output is accumulated and re-rendered on every token. Rendering
//! drops `<think>...</think>` spans, markdown emphasis/heading markers and
//! anything outside printable ASCII, then collapses whitespace runs. While
//! streaming, a trailing fragment that could still grow into `<think>` or a
//! stop sequence is held back, so a character once shown never changes.

/// Opening tag of a reasoning side-channel span.
const THINK_OPEN: &str = "<think>";
/// Closing tag of a reasoning side-channel span.
const THINK_CLOSE: &str = "</think>";
/// Markdown markers removed from visible text.
const MARKDOWN_MARKERS: &[char] = &['*', '_', '#', '`', '~'];

/// Incremental sanitizer over one completion.
#[derive(Debug, Default)]
pub struct Sanitizer {
    raw: String,
    stop_sequences: Vec<String>,
    stopped_on: Option<String>,
    visible: String,
}

impl Sanitizer {
    /// Create a sanitizer that also enforces `stop_sequences`.
    pub fn new(stop_sequences: &[String]) -> Self {
        Self {
            stop_sequences: stop_sequences
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            ..Self::default()
        }
    }

    /// Feed one token. Returns the new visible text when it changed.
    ///
    /// Tokens after a stop sequence has been seen are ignored.
    pub fn push(&mut self, token: &str) -> Option<&str> {
        if self.stopped_on.is_some() || token.is_empty() {
            return None;
        }
        self.raw.push_str(token);

        if let Some((idx, seq)) = self.earliest_stop() {
            self.raw.truncate(idx);
            self.stopped_on = Some(seq);
        }

        let next = if self.stopped_on.is_some() {
            render(&self.raw)
        } else {
            let hold = self.holdback_len();
            render(&self.raw[..self.raw.len() - hold])
        };

        if next == self.visible {
            return None;
        }
        self.visible = next;
        Some(&self.visible)
    }

    /// Whether a stop sequence has terminated the stream.
    pub fn is_stopped(&self) -> bool {
        self.stopped_on.is_some()
    }

    /// The stop sequence that ended the stream, if any.
    pub fn stop_sequence(&self) -> Option<&str> {
        self.stopped_on.as_deref()
    }

    /// Visible text rendered so far.
    pub fn visible(&self) -> &str {
        &self.visible
    }

    /// Render the final text, releasing any held-back tail.
    pub fn finish(&mut self) -> String {
        self.visible = render(&self.raw);
        self.visible.clone()
    }

    fn earliest_stop(&self) -> Option<(usize, String)> {
        self.stop_sequences
            .iter()
            .filter_map(|s| self.raw.find(s.as_str()).map(|idx| (idx, s)))
            .min_by_key(|(idx, _)| *idx)
            .map(|(idx, s)| (idx, s.clone()))
    }

    /// Length of the longest raw suffix that is a proper prefix of a tag or
    /// stop sequence.
    fn holdback_len(&self) -> usize {
        std::iter::once(THINK_OPEN)
            .chain(self.stop_sequences.iter().map(String::as_str))
            .map(|pattern| partial_suffix_len(&self.raw, pattern))
            .max()
            .unwrap_or(0)
    }
}

/// Sanitize a complete text in one pass.
pub fn sanitize(raw: &str) -> String {
    render(raw)
}

fn partial_suffix_len(text: &str, pattern: &str) -> usize {
    (1..pattern.len())
        .rev()
        .filter(|&k| pattern.is_char_boundary(k))
        .find(|&k| text.ends_with(&pattern[..k]))
        .unwrap_or(0)
}

fn render(raw: &str) -> String {
    let without_think = strip_think(raw);
    let mut out = String::with_capacity(without_think.len());
    let mut pending_space = false;
    for ch in without_think.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if MARKDOWN_MARKERS.contains(&ch) || !ch.is_ascii_graphic() {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}

/// Remove `<think>...</think>` spans (shortest match). An unclosed span hides
/// everything after its opening tag.
fn strip_think(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let Some(start) = rest.find(THINK_OPEN) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let inner = &rest[start + THINK_OPEN.len()..];
        match inner.find(THINK_CLOSE) {
            Some(end) => rest = &inner[end + THINK_CLOSE.len()..],
            None => break,
        }
    }
    out
}
