//! Chunks - Sequenced Units of Produced Content
//!
//! A chunk is the only thing that ever travels from a producer to an
//! observer. It carries the conversation it belongs to, a sequence number
//! assigned by the producer, and the cumulative text generated so far.
//!
//! # Wire Shape
//!
//! Chunks serialize to the payload every transport sends verbatim:
//!
//! ```json
//! {"sequence": 3, "content": "This is a", "status": "streaming", "conversationId": "c1"}
//! ```
//!
//! The `error` field is only present on `status: "error"` chunks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Identifier of one logical conversation
///
/// Always non-empty and trimmed. Use [`ConversationId::parse`] at trust
/// boundaries; it rejects blank ids before any session state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Parse a conversation id supplied by a client
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MissingConversationId`] when the id is empty or
    /// only whitespace.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RelayError::MissingConversationId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status carried by every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// More content follows
    Streaming,
    /// The conversation finished; content is empty
    Completed,
    /// The producer failed; `error` describes why
    Error,
}

impl ChunkStatus {
    /// Whether no further chunks follow this one
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

/// One sequenced, immutable unit of produced content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Position of this chunk in its conversation's log
    pub sequence: u64,
    /// Cumulative content produced so far (empty for terminal chunks)
    pub content: String,
    /// Streaming, completed or error
    pub status: ChunkStatus,
    /// Conversation the chunk belongs to
    pub conversation_id: ConversationId,
    /// Failure description, only set on error chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Chunk {
    /// Create a streaming chunk carrying the text produced so far
    pub fn streaming(
        conversation_id: ConversationId,
        sequence: u64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            content: content.into(),
            status: ChunkStatus::Streaming,
            conversation_id,
            error: None,
        }
    }

    /// Create the completion marker
    #[must_use]
    pub fn completed(conversation_id: ConversationId, sequence: u64) -> Self {
        Self {
            sequence,
            content: String::new(),
            status: ChunkStatus::Completed,
            conversation_id,
            error: None,
        }
    }

    /// Create an error marker
    pub fn error(conversation_id: ConversationId, sequence: u64, error: impl Into<String>) -> Self {
        Self {
            sequence,
            content: String::new(),
            status: ChunkStatus::Error,
            conversation_id,
            error: Some(error.into()),
        }
    }

    /// Whether this chunk ends its conversation
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
