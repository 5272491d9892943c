//! Client Registry - Per-Conversation Observer Tracking
//!
//! Tracks every observer attached to one conversation together with its
//! delivery cursor, the highest sequence already pushed to it. The registry
//! is what turns a single producer stream into N independent, resumable
//! streams:
//!
//! - Replays buffered chunks past an observer's cursor when it attaches
//! - Fans live chunks out to every observer whose cursor is behind
//! - Isolates sink failures so one broken observer never stalls the rest
//!
//! # Architecture
//!
//! ```text
//!                      ClientRegistry
//!                     ┌──────────────────────────────────────┐
//!                     │ HashMap<ObserverId, ObserverHandle>  │
//!                     │   - owned by the session lock        │
//!                     └───────────────┬──────────────────────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │  Browser A  │       │  Browser B   │       │  Reconnect   │
//!       │  cursor: 12 │       │  cursor: 12  │       │  cursor: 4   │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! # Thread Safety
//!
//! The registry itself holds no lock. It is owned by a conversation session
//! and only ever mutated behind that session's mutex, which is what makes the
//! replay cursor update and the live-broadcast cursor update mutually
//! exclusive for a given observer.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chunk::Chunk;
use crate::error::SinkError;
use crate::event_log::EventLog;
use crate::session::SessionStatus;

/// Unique identifier for an attached observer
///
/// Allocated per connection; an observer that reconnects gets a new id and
/// resumes through its cursor, not its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(u64);

impl ObserverId {
    /// Create a new unique observer ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create an observer ID from a raw value (for testing)
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

/// Where chunks for one observer go
///
/// Implementations must not block: the session calls `send` while holding
/// its lock.
pub trait ChunkSink: Send + Sync {
    /// Push a chunk to the observer
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] when the observer can no longer accept data.
    fn send(&self, chunk: &Chunk) -> Result<(), SinkError>;

    /// Whether the receiving side has gone away
    fn is_closed(&self) -> bool;
}

impl ChunkSink for mpsc::Sender<Chunk> {
    fn send(&self, chunk: &Chunk) -> Result<(), SinkError> {
        self.try_send(chunk.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

impl ChunkSink for mpsc::UnboundedSender<Chunk> {
    fn send(&self, chunk: &Chunk) -> Result<(), SinkError> {
        mpsc::UnboundedSender::send(self, chunk.clone())
            .map_err(|_| SinkError::Closed)
    }

    fn is_closed(&self) -> bool {
        mpsc::UnboundedSender::is_closed(self)
    }
}

/// Handle to an attached observer
pub struct ObserverHandle {
    /// Unique observer identifier
    pub id: ObserverId,
    /// Highest sequence already delivered (`None` = nothing yet)
    pub cursor: Option<u64>,
    /// When the observer attached
    pub attached_at: Instant,
    sink: Box<dyn ChunkSink>,
}

impl ObserverHandle {
    /// Create a handle around a sink
    #[must_use]
    pub fn new(id: ObserverId, sink: Box<dyn ChunkSink>, cursor: Option<u64>) -> Self {
        Self {
            id,
            cursor,
            attached_at: Instant::now(),
            sink,
        }
    }

    /// Whether this observer still needs `sequence`
    #[must_use]
    pub fn is_behind(&self, sequence: u64) -> bool {
        !matches!(self.cursor, Some(c) if c >= sequence)
    }

    /// Send a chunk and advance the cursor on success
    fn push(&mut self, chunk: &Chunk) -> Result<(), SinkError> {
        self.sink.send(chunk)?;
        self.cursor = Some(chunk.sequence);
        Ok(())
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("cursor", &self.cursor)
            .field("closed", &self.sink.is_closed())
            .finish()
    }
}

/// Outcome of replaying the log to a newly attached observer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Chunks replayed from the log
    pub replayed: usize,
    /// Whether a synthetic completion chunk was sent
    pub synthetic_completion: bool,
    /// Whether the sink failed during replay and the observer was dropped
    pub detached: bool,
}

/// Outcome of fanning a chunk out to all observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Observers that received the chunk
    pub delivered: usize,
    /// Observers whose cursor was already at or past the chunk
    pub skipped: usize,
    /// Observers whose sink failed; they have been detached
    pub failed_ids: Vec<ObserverId>,
}

impl DeliveryReport {
    /// Check if no observer failed
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

/// Attached observers of one conversation
#[derive(Default)]
pub struct ClientRegistry {
    observers: HashMap<ObserverId, ObserverHandle>,
}

impl ClientRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer and replay everything past its cursor
    ///
    /// When the conversation already completed and nothing was pending, a
    /// synthetic completion chunk stamped `log.next_sequence()` is sent so a
    /// late observer still learns the stream is over.
    pub fn attach(
        &mut self,
        id: ObserverId,
        sink: Box<dyn ChunkSink>,
        cursor: Option<u64>,
        log: &EventLog,
        status: SessionStatus,
    ) -> ReplayReport {
        let mut handle = ObserverHandle::new(id, sink, cursor);
        let mut report = ReplayReport::default();

        for chunk in log.query(cursor) {
            if let Err(e) = handle.push(chunk) {
                tracing::warn!(
                    observer_id = %id,
                    sequence = chunk.sequence,
                    error = %e,
                    "Replay failed, dropping observer"
                );
                report.detached = true;
                return report;
            }
            report.replayed += 1;
        }

        if status == SessionStatus::Completed && report.replayed == 0 {
            if let Some(last) = log.last() {
                let marker = Chunk::completed(last.conversation_id.clone(), log.next_sequence());
                if let Err(e) = handle.push(&marker) {
                    tracing::warn!(
                        observer_id = %id,
                        error = %e,
                        "Completion marker not delivered"
                    );
                    report.detached = true;
                    return report;
                }
                report.synthetic_completion = true;
            }
        }

        tracing::debug!(
            observer_id = %id,
            cursor = ?cursor,
            replayed = report.replayed,
            synthetic_completion = report.synthetic_completion,
            "Observer attached"
        );
        self.observers.insert(id, handle);
        report
    }

    /// Detach an observer
    ///
    /// Idempotent: detaching an unknown or already detached id is a no-op.
    /// Returns whether the observer was attached.
    pub fn detach(&mut self, id: &ObserverId) -> bool {
        let removed = self.observers.remove(id).is_some();
        if removed {
            tracing::debug!(
                observer_id = %id,
                remaining = self.observers.len(),
                "Observer detached"
            );
        }
        removed
    }

    /// Fan a chunk out to every observer that has not seen it
    ///
    /// Each send is isolated; failing observers are detached after the
    /// fan-out completes and listed in the report.
    pub fn deliver(&mut self, chunk: &Chunk) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for (id, handle) in &mut self.observers {
            if !handle.is_behind(chunk.sequence) {
                report.skipped += 1;
                continue;
            }
            match handle.push(chunk) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        observer_id = %id,
                        sequence = chunk.sequence,
                        error = %e,
                        "Delivery failed"
                    );
                    report.failed_ids.push(*id);
                }
            }
        }

        for id in &report.failed_ids {
            self.detach(id);
        }
        report
    }

    /// Remove observers whose sinks are closed
    ///
    /// Returns the number of observers removed.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.observers.len();
        self.observers.retain(|id, handle| {
            let open = !handle.sink.is_closed();
            if !open {
                tracing::debug!(observer_id = %id, "Removing closed observer");
            }
            open
        });
        before - self.observers.len()
    }

    /// Detach everyone, dropping their sinks
    pub fn clear(&mut self) -> usize {
        let count = self.observers.len();
        self.observers.clear();
        count
    }

    /// Number of attached observers
    #[must_use]
    pub fn count(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Check if an observer is attached
    #[must_use]
    pub fn contains(&self, id: &ObserverId) -> bool {
        self.observers.contains_key(id)
    }

    /// Current cursor of an attached observer
    #[must_use]
    pub fn cursor_of(&self, id: &ObserverId) -> Option<Option<u64>> {
        self.observers.get(id).map(|h| h.cursor)
    }

    /// IDs of all attached observers
    #[must_use]
    pub fn observer_ids(&self) -> Vec<ObserverId> {
        self.observers.keys().copied().collect()
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("observer_count", &self.observers.len())
            .field("observers", &self.observers.keys().collect::<Vec<_>>())
            .finish()
    }
}
