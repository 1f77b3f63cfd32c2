//! Conversation history and its display projection.
//!
//! The `Conversation` is the context sent on every generation call: it always
//! starts with exactly one system turn. The `DisplayList` mirrors it without the
//! system turn and carries at most one pending assistant entry while a reply is
//! still streaming.

use serde::{Deserialize, Serialize};

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message of the conversation history. Serializes to the `{role, content}`
/// shape the chat backend expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Ordered turn history, never empty.
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn system_prompt(&self) -> &str {
        &self.turns[0].content
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::assistant(content));
    }

    /// Drop everything but the system turn.
    pub fn reset(&mut self) {
        self.turns.truncate(1);
    }
}

/// A user/assistant line shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayEntry {
    pub role: Role,
    pub content: String,
}

impl DisplayEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// Display projection of a conversation, plus the streaming reply in progress.
#[derive(Debug, Clone, Default)]
pub struct DisplayList {
    committed: Vec<DisplayEntry>,
    pending: Option<String>,
}

impl DisplayList {
    pub fn committed(&self) -> &[DisplayEntry] {
        &self.committed
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.committed.push(DisplayEntry::new(role, content));
    }

    pub fn open_pending(&mut self) {
        self.pending = Some(String::new());
    }

    pub fn append_pending(&mut self, delta: &str) {
        if let Some(p) = self.pending.as_mut() {
            p.push_str(delta);
        }
    }

    /// Replace the streamed text with the resolved reply and commit it.
    pub fn commit_pending(&mut self, content: impl Into<String>) {
        self.pending = None;
        self.push(Role::Assistant, content);
    }

    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Committed entries followed by the pending one, as rendered.
    pub fn entries(&self) -> Vec<DisplayEntry> {
        let mut out = self.committed.clone();
        if let Some(p) = &self.pending {
            out.push(DisplayEntry::new(Role::Assistant, p.clone()));
        }
        out
    }

    pub fn clear(&mut self) {
        self.committed.clear();
        self.pending = None;
    }
}

/// Conversation and display list, mutated together so they never drift apart.
#[derive(Debug, Clone)]
pub struct ConversationState {
    conversation: Conversation,
    display: DisplayList,
}

impl ConversationState {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            conversation: Conversation::new(system_prompt),
            display: DisplayList::default(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn display(&self) -> &DisplayList {
        &self.display
    }

    pub fn commit_user(&mut self, text: &str) {
        self.conversation.push_user(text);
        self.display.push(Role::User, text);
    }

    pub fn begin_reply(&mut self) {
        self.display.open_pending();
    }

    pub fn stream_reply(&mut self, delta: &str) {
        self.display.append_pending(delta);
    }

    pub fn commit_reply(&mut self, text: &str) {
        self.conversation.push_assistant(text);
        self.display.commit_pending(text);
    }

    pub fn discard_reply(&mut self) {
        self.display.discard_pending();
    }

    pub fn reset(&mut self) {
        self.conversation.reset();
        self.display.clear();
    }
}
