//! Shared data model: engine/session identity, the event union the runner
//! emits, and the store's on-disk shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type EngineId = String;

/// A resume token minted by an external agent on its first turn and handed
/// back on subsequent turns to continue that conversation. Equality is by
/// both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: EngineId,
    pub value: String,
}

impl ResumeToken {
    pub fn new(engine: impl Into<EngineId>, value: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            value: value.into(),
        }
    }

    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.engine, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub resume: String,
    pub engine: EngineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// `(chat_id, owner_id)`. `owner_id = None` scopes the key to the whole chat
/// rather than one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatKey {
    pub chat_id: i64,
    pub owner_id: Option<i64>,
}

impl ChatKey {
    pub fn new(chat_id: i64, owner_id: Option<i64>) -> Self {
        Self { chat_id, owner_id }
    }

    pub fn as_string(&self) -> String {
        match self.owner_id {
            Some(owner) => format!("{}:{}", self.chat_id, owner),
            None => format!("{}:chat", self.chat_id),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (chat_str, owner_str) = s.split_once(':')?;
        let chat_id: i64 = chat_str.parse().ok()?;
        let owner_id = if owner_str == "chat" {
            None
        } else {
            Some(owner_str.parse().ok()?)
        };
        Some(Self { chat_id, owner_id })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatState {
    pub history: HashMap<String, SessionInfo>,
    pub active: HashMap<EngineId, String>,
    /// Retained for legacy on-disk compatibility; always null once migrated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<serde_json::Value>,
}

pub const STORE_SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreState {
    pub version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub chats: HashMap<String, ChatState>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            version: STORE_SCHEMA_VERSION,
            cwd: None,
            chats: HashMap::new(),
        }
    }
}

/// A user-visible sub-step: a command run, tool call, file edit, or
/// diagnostic note. `id` identifies the logical action whose started/
/// completed events share it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    #[serde(default)]
    pub detail: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Command,
    Tool,
    WebSearch,
    FileChange,
    Note,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionLevel {
    Info,
    Warning,
    Error,
}

/// The uniform internal event stream a runner invocation produces.
#[derive(Debug, Clone)]
pub enum TakopiEvent {
    SessionStarted {
        engine: EngineId,
        resume: ResumeToken,
        title: Option<String>,
    },
    ActionStarted {
        engine: EngineId,
        action: Action,
    },
    ActionCompleted {
        engine: EngineId,
        action: Action,
        ok: bool,
        message: Option<String>,
        level: ActionLevel,
        detail: HashMap<String, serde_json::Value>,
    },
    Completed {
        engine: EngineId,
        ok: bool,
        answer: String,
        resume: Option<ResumeToken>,
        error: Option<String>,
    },
}

impl TakopiEvent {
    pub fn is_completed(&self) -> bool {
        matches!(self, TakopiEvent::Completed { .. })
    }
}

/// Per-runner-invocation scratch: a monotone counter for synthesizing
/// diagnostic action ids (`"{tag}.note.{n}"`).
#[derive(Debug, Default)]
pub struct RunState {
    note_seq: u64,
}

impl RunState {
    pub fn next_note_id(&mut self, tag: &str) -> String {
        self.note_seq += 1;
        format!("{tag}.note.{}", self.note_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_key_round_trips_with_owner() {
        let key = ChatKey::new(42, Some(7));
        let s = key.as_string();
        assert_eq!(s, "42:7");
        assert_eq!(ChatKey::parse(&s), Some(key));
    }

    #[test]
    fn chat_key_round_trips_without_owner() {
        let key = ChatKey::new(42, None);
        let s = key.as_string();
        assert_eq!(s, "42:chat");
        assert_eq!(ChatKey::parse(&s), Some(key));
    }

    #[test]
    fn resume_token_equality_is_by_both_fields() {
        let a = ResumeToken::new("codex", "sess-1");
        let b = ResumeToken::new("codex", "sess-1");
        let c = ResumeToken::new("claude", "sess-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.lock_key(), "codex:sess-1");
    }
}
