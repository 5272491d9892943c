//! Error Types
//!
//! Every failure in the relay is scoped to a single conversation or a single
//! observer. None of these errors is fatal to the process.

use thiserror::Error;

use crate::chunk::ConversationId;

/// Errors surfaced by the session engine
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// A request arrived without a usable conversation id
    #[error("conversationId is required")]
    MissingConversationId,

    /// A chunk did not advance its conversation's log
    #[error("sequence {sequence} does not advance log of {conversation_id} (last: {last})")]
    SequenceRegression {
        /// Conversation whose log rejected the chunk
        conversation_id: ConversationId,
        /// Sequence of the rejected chunk
        sequence: u64,
        /// Current high-water mark of the log
        last: u64,
    },

    /// The session was ended and accepts no further observers
    #[error("conversation {0} has been ended")]
    SessionEnded(ConversationId),
}

/// Failure to push a chunk through an observer's sink
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The receiving side went away
    #[error("observer sink closed")]
    Closed,

    /// The observer is not draining fast enough
    #[error("observer sink full")]
    Full,
}

/// Failure raised by a content producer
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProducerError {
    /// The generation backend failed mid-stream
    #[error("generation failed: {0}")]
    Generation(String),
}
