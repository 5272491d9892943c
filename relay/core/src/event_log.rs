//! Event Log
//!
//! Append-only, ordered record of every chunk a conversation has produced.
//! Observers that reconnect are replayed from here, so the log is the single
//! source of truth for "what has been said so far".
//!
//! Sequence numbers are strictly increasing but need not be contiguous:
//! terminal chunks are stamped with `last + 1` even if the producer skipped
//! values before.

use crate::chunk::Chunk;
use crate::error::RelayError;

/// Ordered chunks of one conversation
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    chunks: Vec<Chunk>,
}

impl EventLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SequenceRegression`] when the chunk's sequence
    /// does not exceed the current high-water mark. The log is unchanged.
    pub fn append(&mut self, chunk: Chunk) -> Result<(), RelayError> {
        if let Some(last) = self.last_sequence() {
            if chunk.sequence <= last {
                return Err(RelayError::SequenceRegression {
                    conversation_id: chunk.conversation_id,
                    sequence: chunk.sequence,
                    last,
                });
            }
        }
        self.chunks.push(chunk);
        Ok(())
    }

    /// Every chunk with `sequence > since`, in order
    ///
    /// `None` means the caller has seen nothing and yields the whole log.
    pub fn query(&self, since: Option<u64>) -> impl Iterator<Item = &Chunk> + '_ {
        // The log is sorted, so the first match marks where replay starts.
        let start = match since {
            Some(since) => self.chunks.partition_point(|c| c.sequence <= since),
            None => 0,
        };
        self.chunks[start..].iter()
    }

    /// Most recently appended chunk
    #[must_use]
    pub fn last(&self) -> Option<&Chunk> {
        self.chunks.last()
    }

    /// High-water mark, if anything has been appended
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.chunks.last().map(|c| c.sequence)
    }

    /// Sequence to stamp on a chunk synthesized by the session
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence().map_or(0, |s| s + 1)
    }

    /// Number of chunks recorded
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing has been appended yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
