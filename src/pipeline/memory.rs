//! Remember/forget keyword detection.

use crate::config::ConversationConfig;

/// Case-insensitive keyword sets for long-term memory control.
#[derive(Debug, Clone)]
pub struct MemoryKeywords {
    remember: Vec<String>,
    forget: Vec<String>,
}

impl MemoryKeywords {
    pub fn new(remember: &[String], forget: &[String]) -> Self {
        let lower = |words: &[String]| {
            words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect()
        };
        Self {
            remember: lower(remember),
            forget: lower(forget),
        }
    }

    /// A user message mentioning any remember keyword is kept in every
    /// prompt window.
    pub fn should_remember(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.remember.iter().any(|w| text.contains(w.as_str()))
    }

    /// All forget keywords must appear ("forget my memories").
    pub fn is_forget_request(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        !self.forget.is_empty() && self.forget.iter().all(|w| text.contains(w.as_str()))
    }
}

impl From<&ConversationConfig> for MemoryKeywords {
    fn from(config: &ConversationConfig) -> Self {
        Self::new(&config.remember_keywords, &config.forget_keywords)
    }
}
