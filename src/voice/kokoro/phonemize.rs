//! Text preparation and misaki G2P for Kokoro.
//!
//! Replies reach the synthesizer already sanitized (ASCII, no markdown), so
//! normalization here only covers what the phonemizer reads badly: symbols,
//! currency amounts and dotted abbreviations. Long replies are split at
//! sentence boundaries so each chunk fits the model context.

use crate::error::{CompanionError, Result};

/// Wrapper around the misaki grapheme-to-phoneme converter.
pub struct Phonemizer {
    g2p: misaki_rs::G2P,
}

impl Phonemizer {
    /// `british` selects British English pronunciation.
    pub fn new(british: bool) -> Self {
        let lang = if british {
            misaki_rs::Language::EnglishGB
        } else {
            misaki_rs::Language::EnglishUS
        };
        Self {
            g2p: misaki_rs::G2P::new(lang),
        }
    }

    /// Normalize `text` and convert it to a phoneme string.
    ///
    /// # Errors
    ///
    /// [`CompanionError::SpeechSynthesis`] if G2P fails or yields nothing.
    pub fn phonemize(&self, text: &str) -> Result<String> {
        let normalized = normalize_text(text);
        let (phonemes, _tokens) = self
            .g2p
            .g2p(&normalized)
            .map_err(|e| CompanionError::SpeechSynthesis(format!("phonemization failed: {e}")))?;
        if phonemes.trim().is_empty() {
            return Err(CompanionError::SpeechSynthesis(
                "phonemization produced empty output".into(),
            ));
        }
        Ok(phonemes)
    }
}

/// Abbreviations expanded before phonemization.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("Dr.", "Doctor"),
    ("Mr.", "Mister"),
    ("Mrs.", "Missus"),
    ("Ms.", "Miz"),
    ("St.", "Saint"),
    ("vs.", "versus"),
    ("e.g.", "for example"),
    ("i.e.", "that is"),
    ("etc.", "et cetera"),
];

/// Make `text` speakable.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&normalize_word(word));
    }
    out
}

fn normalize_word(word: &str) -> String {
    if let Some((_, expanded)) = ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == word) {
        return (*expanded).to_owned();
    }
    if let Some(amount) = word.strip_prefix('$') {
        let digits: String = amount.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let rest = &amount[digits.len()..];
            let unit = if digits == "1" { "dollar" } else { "dollars" };
            return format!("{digits} {unit}{rest}");
        }
    }
    word.replace('&', " and ")
        .replace('%', " percent")
        .replace('+', " plus ")
        .replace('@', " at ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `text` into sentence chunks of at most `max_chars` characters.
///
/// Sentences longer than the limit are split at word boundaries.
pub fn split_sentences(text: &str, max_chars: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            push_trimmed(&mut sentences, &current);
            current.clear();
        }
    }
    push_trimmed(&mut sentences, &current);

    let mut chunks = Vec::new();
    for sentence in sentences {
        if sentence.len() <= max_chars {
            chunks.push(sentence);
            continue;
        }
        let mut chunk = String::new();
        for word in sentence.split_whitespace() {
            if !chunk.is_empty() && chunk.len() + 1 + word.len() > max_chars {
                chunks.push(std::mem::take(&mut chunk));
            }
            if !chunk.is_empty() {
                chunk.push(' ');
            }
            chunk.push_str(word);
        }
        push_trimmed(&mut chunks, &chunk);
    }
    chunks
}

fn push_trimmed(out: &mut Vec<String>, s: &str) {
    let t = s.trim();
    if !t.is_empty() {
        out.push(t.to_owned());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn symbols_and_currency_are_spoken() {
        assert_eq!(normalize_text("Tea & cake"), "Tea and cake");
        assert_eq!(normalize_text("about 50% done"), "about 50 percent done");
        assert_eq!(normalize_text("It costs $5."), "It costs 5 dollars.");
        assert_eq!(normalize_text("just $1"), "just 1 dollar");
        assert_eq!(normalize_text("$ alone"), "$ alone");
    }

    #[test]
    fn abbreviations_expand_whole_words_only() {
        assert_eq!(normalize_text("Ask Dr. Who"), "Ask Doctor Who");
        assert_eq!(normalize_text("apples, pears, etc."), "apples, pears, et cetera");
        assert_eq!(normalize_text("Drive"), "Drive");
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hi there! How are you? Fine.", 100),
            vec!["Hi there!", "How are you?", "Fine."]
        );
        assert_eq!(split_sentences("no terminator", 100), vec!["no terminator"]);
        assert!(split_sentences("   ", 100).is_empty());
    }

    #[test]
    fn long_sentences_split_on_words() {
        let chunks = split_sentences("one two three four five", 9);
        assert_eq!(chunks, vec!["one two", "three", "four five"]);
        assert!(chunks.iter().all(|c| c.len() <= 9));
    }
}
