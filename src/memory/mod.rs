//! Dialogue memory.
//!
//! - [`Memory`]: the transient, per-invocation message list sent to a model
//! - [`weighted`]: token-budgeted selection over scored history entries
//! - [`history`]: the persistence collaborator nodes read earlier turns from

mod history;
pub mod weighted;

pub use history::{HistoryStore, InMemoryHistory, Turn};
pub use weighted::{replay, select_within_budget, weigh_turns, MemorySource, SourceWeights, WeightedEntry};

use crate::llm::ChatMessage;

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Ordered, role-tagged messages for one invocation.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    messages: Vec<ChatMessage>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a memory with a system instruction.
    pub fn with_system(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let mut memory = Self::new();
        if !prompt.is_empty() {
            memory.push(ChatMessage::system(prompt));
        }
        memory
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    /// Append earlier turns as user/assistant pairs.
    pub fn extend_turns(&mut self, turns: &[Turn]) {
        for turn in turns {
            self.push_user(turn.query.clone());
            self.push_assistant(turn.answer.clone());
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum()
    }

    /// Messages as JSON, the shape model nodes accept in `arguments["messages"]`.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.messages).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_memory_from_turns() {
        let mut memory = Memory::with_system("be brief");
        memory.extend_turns(&[Turn::new("2+2", "4")]);
        memory.push_user("3+3");
        let roles: Vec<Role> = memory.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(memory.to_value()[1]["content"], "2+2");
    }

    #[test]
    fn test_empty_system_prompt_is_skipped() {
        assert!(Memory::with_system("").is_empty());
    }
}
