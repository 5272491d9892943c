//! Content Producers
//!
//! A producer turns a conversation's initial input into a stream of
//! sequenced chunks and pushes each one through a [`ChunkBroadcaster`]. It
//! never sees observers, cursors or the event log; swapping the simulated
//! producer for a real generation backend touches nothing else.
//!
//! # Chunk Convention
//!
//! Every streaming chunk carries the CUMULATIVE text produced so far, not a
//! delta. Replay logic depends on this: an observer that resumes only needs
//! the newest chunk it missed to render the full response.
//!
//! Sequences run `0..n-1` for streaming chunks, then exactly one empty
//! `completed` chunk at `n`. A failing producer returns `Err` and never emits
//! the completion chunk; the session turns the error into an `error` chunk.

use std::time::Duration;

use async_trait::async_trait;

use crate::chunk::{Chunk, ConversationId};
use crate::error::ProducerError;
use crate::session::{BroadcastOutcome, ChunkBroadcaster};

/// Default delay before each simulated word
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

/// Content producer trait
///
/// Implement this trait to plug in a generation backend.
#[async_trait]
pub trait ContentProducer: Send + Sync {
    /// Producer name for logs (e.g., "simulated")
    fn name(&self) -> &str;

    /// Generate the response to `input`, broadcasting every chunk
    ///
    /// # Errors
    ///
    /// Returns a [`ProducerError`] when generation fails part-way. The
    /// completion chunk must not have been emitted in that case.
    async fn produce(
        &self,
        conversation_id: &ConversationId,
        input: &str,
        out: &dyn ChunkBroadcaster,
    ) -> Result<(), ProducerError>;
}

/// Stand-in for a streaming generation backend
///
/// Emits one word per pacing interval. Stops quietly if the session stops
/// accepting chunks (for example after a manual end).
#[derive(Clone, Debug)]
pub struct SimulatedProducer {
    pacing: Duration,
    script: Option<Vec<String>>,
    fail_after: Option<usize>,
}

impl Default for SimulatedProducer {
    fn default() -> Self {
        Self::new(DEFAULT_PACING)
    }
}

impl SimulatedProducer {
    /// Reply to the input with a canned sentence
    #[must_use]
    pub fn new(pacing: Duration) -> Self {
        Self {
            pacing,
            script: None,
            fail_after: None,
        }
    }

    /// Always emit the given words, whatever the input
    pub fn scripted<I, S>(pacing: Duration, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pacing,
            script: Some(words.into_iter().map(Into::into).collect()),
            fail_after: None,
        }
    }

    /// Fail after emitting `chunks` streaming chunks
    #[must_use]
    pub fn with_failure_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Delay before each word
    #[must_use]
    pub fn pacing(&self) -> Duration {
        self.pacing
    }

    fn words_for(&self, input: &str) -> Vec<String> {
        match &self.script {
            Some(words) => words.clone(),
            None => format!(
                "This is a reply to \"{input}\". We are simulating a streamed generation, \
                 sending the data in several chunks."
            )
            .split(' ')
            .map(str::to_string)
            .collect(),
        }
    }
}

#[async_trait]
impl ContentProducer for SimulatedProducer {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn produce(
        &self,
        conversation_id: &ConversationId,
        input: &str,
        out: &dyn ChunkBroadcaster,
    ) -> Result<(), ProducerError> {
        let words = self.words_for(input);
        let mut text = String::new();

        for (index, word) in words.iter().enumerate() {
            // Pacing stands in for generation latency
            tokio::time::sleep(self.pacing).await;

            if self.fail_after == Some(index) {
                return Err(ProducerError::Generation(format!(
                    "simulated failure after {index} chunks"
                )));
            }

            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(word);

            let chunk = Chunk::streaming(conversation_id.clone(), index as u64, text.clone());
            if matches!(out.broadcast(chunk), BroadcastOutcome::Ignored) {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    "Session no longer accepting chunks, stopping"
                );
                return Ok(());
            }
        }

        out.broadcast(Chunk::completed(
            conversation_id.clone(),
            words.len() as u64,
        ));
        Ok(())
    }
}
