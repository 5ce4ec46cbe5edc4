use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::user::RemoteId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Audio,
    Error,
}

/// One entry of the chat transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Local id, unique and increasing within one `MessageLog`.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub sender: Sender,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Id the agent assigned to its reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<RemoteId>,
}

/// A message before the log stamps it with an id and time.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub sender: Sender,
    pub kind: MessageKind,
    pub content: String,
    pub audio_url: Option<String>,
    pub message_id: Option<RemoteId>,
}

impl MessageDraft {
    pub fn user_text(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            kind: MessageKind::Text,
            content: content.into(),
            audio_url: None,
            message_id: None,
        }
    }

    pub fn user_audio(caption: impl Into<String>, audio_url: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            kind: MessageKind::Audio,
            content: caption.into(),
            audio_url: Some(audio_url.into()),
            message_id: None,
        }
    }

    pub fn agent_reply(content: impl Into<String>, message_id: Option<RemoteId>) -> Self {
        Self {
            sender: Sender::Agent,
            kind: MessageKind::Text,
            content: content.into(),
            audio_url: None,
            message_id,
        }
    }

    pub fn agent_error(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::Agent,
            kind: MessageKind::Error,
            content: content.into(),
            audio_url: None,
            message_id: None,
        }
    }
}

/// Append-only transcript. Ids come from a counter that survives `clear`,
/// so two messages never share an id even when created in the same instant.
#[derive(Debug, Default)]
pub struct MessageLog {
    next_id: u64,
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, draft: MessageDraft) -> &Message {
        self.next_id += 1;
        self.entries.push(Message {
            id: self.next_id,
            timestamp: Utc::now(),
            sender: draft.sender,
            kind: draft.kind,
            content: draft.content,
            audio_url: draft.audio_url,
            message_id: draft.message_id,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty the log, handing back the removed messages.
    pub fn clear(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.entries)
    }
}
