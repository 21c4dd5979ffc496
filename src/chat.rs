//! Chat transcript.
//!
//! Append-only, except that the last assistant entry is mutated in place
//! while its reply streams in. Once finished, an entry never changes again.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A file supplied by the picker, ready to send with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64 (standard alphabet) file contents.
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    /// Guess a MIME type from a file name's extension.
    pub fn mime_for_name(name: &str) -> &'static str {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => "application/pdf",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            "heic" => "image/heic",
            "txt" | "md" => "text/plain",
            "csv" => "text/csv",
            _ => "application/octet-stream",
        }
    }
}

/// A grounding source attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub uri: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub text: String,
    /// Name of the attached file, if any.
    pub attachment: Option<String>,
    pub citations: Vec<Citation>,
    pub is_streaming: bool,
    pub created_at: DateTime<Utc>,
}

/// The chat transcript.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    next_id: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: u64) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append a finished user message. Returns its id.
    pub fn push_user(&mut self, text: impl Into<String>, attachment: Option<&Attachment>) -> u64 {
        self.push(Role::User, text.into(), attachment.map(|a| a.name.clone()), false)
    }

    /// Append an empty assistant entry that will receive streamed text.
    pub fn begin_assistant(&mut self) -> u64 {
        self.push(Role::Assistant, String::new(), None, true)
    }

    /// Append text to the in-progress reply.
    ///
    /// Only the last entry can receive text, and only while it is streaming.
    /// Returns `false` if `id` is not that entry.
    pub fn append_delta(&mut self, id: u64, delta: &str, citations: &[Citation]) -> bool {
        let Some(last) = self.streaming_tail(id) else {
            return false;
        };
        last.text.push_str(delta);
        for c in citations {
            if !last.citations.contains(c) {
                last.citations.push(c.clone());
            }
        }
        true
    }

    /// Mark the in-progress reply complete. Returns the finished message.
    pub fn finish(&mut self, id: u64) -> Option<&Message> {
        let last = self.streaming_tail(id)?;
        last.is_streaming = false;
        Some(last)
    }

    /// The reply failed. An empty placeholder is removed; partial text is
    /// kept and finalized. Returns `true` if the entry was removed.
    pub fn fail(&mut self, id: u64) -> bool {
        let Some(last) = self.streaming_tail(id) else {
            return false;
        };
        if last.text.is_empty() {
            self.messages.pop();
            true
        } else {
            last.is_streaming = false;
            false
        }
    }

    fn streaming_tail(&mut self, id: u64) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|m| m.id == id && m.is_streaming)
    }

    fn push(&mut self, role: Role, text: String, attachment: Option<String>, is_streaming: bool) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.messages.push(Message {
            id,
            role,
            text,
            attachment,
            citations: Vec::new(),
            is_streaming,
            created_at: Utc::now(),
        });
        id
    }
}
