//! Prompt window assembly.

use crate::message::{ChatMessage, Message, Role};

/// Build the prompt for the next completion.
///
/// Order: the persona message, then older messages flagged `to_remember`,
/// then the most recent `recent` messages. Drafts and stored system rows
/// are left out.
pub fn build_prompt_window(log: &[Message], system_prompt: &str, recent: usize) -> Vec<ChatMessage> {
    let eligible: Vec<&Message> = log
        .iter()
        .filter(|m| !m.is_draft && m.role != Role::System)
        .collect();
    let split = eligible.len().saturating_sub(recent);
    let (older, newest) = eligible.split_at(split);

    let mut window = Vec::with_capacity(1 + newest.len());
    window.push(ChatMessage::new(Role::System, system_prompt));
    window.extend(older.iter().filter(|m| m.to_remember).map(|m| m.to_chat()));
    window.extend(newest.iter().map(|m| m.to_chat()));
    window
}
