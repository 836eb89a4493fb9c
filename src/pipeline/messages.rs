//! In-memory message log with draft reconciliation.
//!
//! The log is authoritative for what the user sees. Drafts live only here;
//! a draft is replaced wholesale on every update and becomes final once.

use crate::message::{Message, Role};

/// Ordered conversation log.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// Index of the trailing draft for `role`, if any.
    ///
    /// Only the run of drafts at the tail is searched.
    pub fn draft_index(&self, role: Role) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .take_while(|(_, m)| m.is_draft)
            .find(|(_, m)| m.role == role)
            .map(|(i, _)| i)
    }

    /// Set the content of the trailing `role` draft, creating it if needed.
    /// Returns its index.
    pub fn upsert_draft(&mut self, role: Role, content: &str) -> usize {
        match self.draft_index(role) {
            Some(i) => {
                content.clone_into(&mut self.messages[i].content);
                i
            }
            None => self.push(Message::draft(role, content)),
        }
    }

    /// Remove the trailing `role` draft.
    pub fn take_draft(&mut self, role: Role) -> Option<(usize, Message)> {
        let i = self.draft_index(role)?;
        Some((i, self.messages.remove(i)))
    }

    /// Append a message and return its index.
    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn remove(&mut self, index: usize) -> Option<Message> {
        (index < self.messages.len()).then(|| self.messages.remove(index))
    }

    /// Freeze the draft at `index` with its final content.
    ///
    /// Returns `None` if `index` is not a draft.
    pub fn finalize(&mut self, index: usize, content: &str) -> Option<&Message> {
        let message = self.messages.get_mut(index).filter(|m| m.is_draft)?;
        content.clone_into(&mut message.content);
        message.is_draft = false;
        message.timestamp = Some(chrono::Utc::now().timestamp());
        Some(message)
    }

    /// Record the store row id of a persisted message.
    pub fn set_id(&mut self, index: usize, id: i64) {
        if let Some(m) = self.messages.get_mut(index) {
            m.id = Some(id);
        }
    }

    /// Clear every `to_remember` flag. Returns how many were set.
    pub fn clear_remember_flags(&mut self) -> usize {
        let mut cleared = 0;
        for m in self.messages.iter_mut().filter(|m| m.to_remember) {
            m.to_remember = false;
            cleared += 1;
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn drafts(log: &MessageLog, role: Role) -> usize {
        log.messages()
            .iter()
            .filter(|m| m.is_draft && m.role == role)
            .count()
    }

    #[test]
    fn repeated_updates_keep_a_single_draft() {
        let mut log = MessageLog::default();
        log.push(Message::new(Role::Assistant, "Hello"));
        for partial in ["I", "I like", "I like tea"] {
            let i = log.upsert_draft(Role::User, partial);
            assert_eq!(i, 1);
            assert_eq!(drafts(&log, Role::User), 1);
        }
        assert_eq!(log.get(1).unwrap().content, "I like tea");
    }

    #[test]
    fn drafts_of_different_roles_coexist_at_tail() {
        let mut log = MessageLog::default();
        let u = log.upsert_draft(Role::User, "hi");
        let a = log.upsert_draft(Role::Assistant, "");
        assert_ne!(u, a);
        assert_eq!(log.upsert_draft(Role::User, "hi there"), u);
        assert_eq!(drafts(&log, Role::User), 1);
        assert_eq!(drafts(&log, Role::Assistant), 1);
    }

    #[test]
    fn finalized_message_is_not_reused_as_draft() {
        let mut log = MessageLog::default();
        let i = log.upsert_draft(Role::Assistant, "Hi");
        assert!(log.finalize(i, "Hi there!").is_some());
        assert!(log.finalize(i, "again").is_none());
        let j = log.upsert_draft(Role::Assistant, "");
        assert_eq!(j, 1);
        assert_eq!(log.get(0).unwrap().content, "Hi there!");
        assert!(!log.get(0).unwrap().is_draft);
    }

    #[test]
    fn take_draft_removes_it() {
        let mut log = MessageLog::default();
        log.upsert_draft(Role::User, "partial");
        let (i, draft) = log.take_draft(Role::User).unwrap();
        assert_eq!(i, 0);
        assert_eq!(draft.content, "partial");
        assert!(log.is_empty());
        assert!(log.take_draft(Role::User).is_none());
    }

    #[test]
    fn clearing_flags_counts_changes() {
        let mut log = MessageLog::from_messages(vec![
            Message::new(Role::User, "remember tea").remembered(true),
            Message::new(Role::Assistant, "ok"),
            Message::new(Role::User, "remember cake").remembered(true),
        ]);
        assert_eq!(log.clear_remember_flags(), 2);
        assert!(log.messages().iter().all(|m| !m.to_remember));
        assert_eq!(log.clear_remember_flags(), 0);
    }
}
