//! Uploaded files waiting in a batch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of a chat (conversation) on the messaging transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single message within a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One admitted upload awaiting conversion.
///
/// Owned by the batch it was appended to and never mutated afterwards. Cloning is cheap:
/// the content is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// Raw uploaded bytes
    pub content: Bytes,
    /// Filename as declared by the uploader
    pub filename: String,
    /// Message that carried the upload
    pub message_id: MessageId,
    /// Chat the upload arrived in
    pub chat_id: ChatId,
}

impl PendingFile {
    pub fn new(
        content: impl Into<Bytes>,
        filename: impl Into<String>,
        message_id: MessageId,
        chat_id: ChatId,
    ) -> Self {
        Self {
            content: content.into(),
            filename: filename.into(),
            message_id,
            chat_id,
        }
    }

    /// Size of the content in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }
}
