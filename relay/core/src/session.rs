//! Conversation Sessions
//!
//! A session owns everything the relay knows about one conversation: the
//! event log, the attached observers and the lifecycle status. Observers can
//! attach, detach and reattach at any point; the session guarantees that each
//! of them sees every chunk past its cursor exactly once per attachment.
//!
//! # State Machine
//!
//! ```text
//!   Pending ──start()──▶ Streaming ──completed chunk──▶ Completed
//!                            │
//!                            └──────producer failure───▶ Interrupted
//! ```
//!
//! `Completed` and `Interrupted` are terminal. `end_manually()` forces a
//! completed-equivalent teardown from any state.
//!
//! # Concurrency
//!
//! All mutation goes through one mutex per session, so unrelated
//! conversations never contend. Sinks are non-blocking, which keeps every
//! critical section free of await points.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::chunk::{Chunk, ChunkStatus, ConversationId};
use crate::client_registry::{ChunkSink, ClientRegistry, DeliveryReport, ObserverId, ReplayReport};
use crate::error::RelayError;
use crate::event_log::EventLog;
use crate::producer::ContentProducer;

/// Lifecycle status of a conversation session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, producer not started yet
    Pending,
    /// Producer is emitting chunks
    Streaming,
    /// Producer emitted its completion chunk (or the session was ended)
    Completed,
    /// Producer failed; an error chunk was broadcast
    Interrupted,
}

impl SessionStatus {
    /// Whether the producer will never emit again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted)
    }

    /// Lowercase name, as it appears on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a chunk handed to [`ChunkBroadcaster::broadcast`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Appended to the log and fanned out
    Delivered(DeliveryReport),
    /// The session is terminal or torn down; the chunk was dropped
    Ignored,
    /// The chunk did not advance the log
    Rejected(RelayError),
}

impl BroadcastOutcome {
    /// Whether the chunk made it into the log
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

/// The single entry point a producer writes through
///
/// Producers know nothing about observers or cursors; fan-out is entirely
/// the session's job.
pub trait ChunkBroadcaster: Send + Sync {
    /// Record a chunk and fan it out
    fn broadcast(&self, chunk: Chunk) -> BroadcastOutcome;
}

/// Read-only view of a session for status queries
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Conversation this session serves
    pub conversation_id: ConversationId,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// High-water mark of the log
    pub last_sequence: Option<u64>,
    /// Chunks recorded in the log
    pub chunk_count: usize,
    /// Observers currently attached
    pub observer_count: usize,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last attach, detach or broadcast
    pub last_activity_at: DateTime<Utc>,
}

/// Mutable part of a session, guarded by the session mutex
struct SessionState {
    status: SessionStatus,
    log: EventLog,
    registry: ClientRegistry,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    producer: Option<AbortHandle>,
    torn_down: bool,
}

impl SessionState {
    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_activity = Instant::now();
    }

    /// Drop the producer handle, aborting the task if it may still run
    fn release_producer(&mut self, abort: bool) {
        if let Some(handle) = self.producer.take() {
            if abort {
                handle.abort();
            }
        }
    }

    /// Append and fan out; caller has already checked liveness
    fn record(&mut self, chunk: &Chunk) -> Result<DeliveryReport, RelayError> {
        self.log.append(chunk.clone())?;
        self.touch();
        Ok(self.registry.deliver(chunk))
    }
}

/// One conversation: event log, attached observers and lifecycle
pub struct ConversationSession {
    conversation_id: ConversationId,
    initial_input: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl ConversationSession {
    /// Create a session in `Pending`
    pub fn new(conversation_id: ConversationId, initial_input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            initial_input: initial_input.into(),
            created_at: now,
            state: Mutex::new(SessionState {
                status: SessionStatus::Pending,
                log: EventLog::new(),
                registry: ClientRegistry::new(),
                last_activity_at: now,
                last_activity: Instant::now(),
                producer: None,
                torn_down: false,
            }),
        }
    }

    /// Conversation this session serves
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Input the producer was (or will be) started with
    #[must_use]
    pub fn initial_input(&self) -> &str {
        &self.initial_input
    }

    /// Current lifecycle status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Observers currently attached
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.lock().registry.count()
    }

    /// High-water mark of the log
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.state.lock().log.last_sequence()
    }

    /// Whether the session was ended or evicted
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.state.lock().torn_down
    }

    /// Start the producer, moving `Pending` to `Streaming`
    ///
    /// Runs at most once per session; later calls return `false`. Must be
    /// called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, producer: Arc<dyn ContentProducer>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Pending || state.torn_down {
                return false;
            }
            state.status = SessionStatus::Streaming;
            state.touch();
        }

        tracing::info!(
            conversation_id = %self.conversation_id,
            producer = producer.name(),
            "Starting producer"
        );

        let session = Arc::clone(self);
        let span = tracing::info_span!("producer", conversation_id = %self.conversation_id);
        let task = tokio::spawn(
            async move {
                let result = producer
                    .produce(&session.conversation_id, &session.initial_input, &*session)
                    .await;
                match result {
                    Ok(()) => tracing::debug!("Producer finished"),
                    Err(e) => session.fail(&e.to_string()),
                }
            }
            .instrument(span),
        );

        let mut state = self.state.lock();
        if state.torn_down {
            task.abort();
        } else if !state.status.is_terminal() {
            state.producer = Some(task.abort_handle());
        }
        true
    }

    /// Record a producer failure
    ///
    /// Moves the session to `Interrupted` and broadcasts an error chunk
    /// stamped `last + 1`. No-op once the session is terminal or torn down.
    pub fn fail(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.torn_down || state.status.is_terminal() {
            return;
        }

        let chunk = Chunk::error(
            self.conversation_id.clone(),
            state.log.next_sequence(),
            reason,
        );
        state.status = SessionStatus::Interrupted;
        match state.record(&chunk) {
            Ok(report) => tracing::warn!(
                conversation_id = %self.conversation_id,
                sequence = chunk.sequence,
                delivered = report.delivered,
                error = reason,
                "Producer failed, session interrupted"
            ),
            Err(e) => tracing::error!(
                conversation_id = %self.conversation_id,
                error = %e,
                "Could not record error chunk"
            ),
        }
        state.release_producer(false);
    }

    /// Attach an observer and replay everything past its cursor
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionEnded`] if the session was torn down.
    pub fn attach_observer(
        &self,
        observer_id: ObserverId,
        sink: Box<dyn ChunkSink>,
        cursor: Option<u64>,
    ) -> Result<ReplayReport, RelayError> {
        let mut guard = self.state.lock();
        if guard.torn_down {
            return Err(RelayError::SessionEnded(self.conversation_id.clone()));
        }
        guard.touch();

        let state = &mut *guard;
        let report = state
            .registry
            .attach(observer_id, sink, cursor, &state.log, state.status);

        tracing::info!(
            conversation_id = %self.conversation_id,
            observer_id = %observer_id,
            cursor = ?cursor,
            replayed = report.replayed,
            observers = state.registry.count(),
            "Observer joined session"
        );

        if report.detached {
            Self::release_if_idle(&self.conversation_id, state);
        }
        Ok(report)
    }

    /// Detach an observer; idempotent
    ///
    /// Detaching the last observer of a completed session releases the
    /// producer handle.
    pub fn detach_observer(&self, observer_id: &ObserverId) -> bool {
        let mut state = self.state.lock();
        let removed = state.registry.detach(observer_id);
        if removed {
            state.touch();
            tracing::info!(
                conversation_id = %self.conversation_id,
                observer_id = %observer_id,
                observers = state.registry.count(),
                "Observer left session"
            );
            Self::release_if_idle(&self.conversation_id, &mut state);
        }
        removed
    }

    fn release_if_idle(conversation_id: &ConversationId, state: &mut SessionState) {
        if state.registry.is_empty() && state.status == SessionStatus::Completed {
            state.release_producer(false);
            tracing::debug!(conversation_id = %conversation_id, "Released producer resources");
        }
    }

    /// Remove observers whose sinks closed without detaching
    pub fn prune_closed_observers(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.registry.prune_closed();
        if removed > 0 {
            Self::release_if_idle(&self.conversation_id, &mut state);
        }
        removed
    }

    /// Tear the session down on user request
    ///
    /// Aborts the producer, drops every observer sink and ignores any later
    /// broadcast. Returns `false` if the session was already torn down.
    pub fn end_manually(&self) -> bool {
        self.teardown("manual")
    }

    pub(crate) fn teardown(&self, reason: &'static str) -> bool {
        let mut state = self.state.lock();
        if state.torn_down {
            return false;
        }
        state.torn_down = true;
        if !state.status.is_terminal() {
            state.status = SessionStatus::Completed;
        }
        let dropped = state.registry.clear();
        state.release_producer(true);
        state.touch();

        tracing::info!(
            conversation_id = %self.conversation_id,
            reason = reason,
            dropped_observers = dropped,
            "Session torn down"
        );
        true
    }

    /// Whether the sweep may evict this session
    ///
    /// Only terminal, observer-less sessions idle for longer than
    /// `idle_timeout` qualify.
    #[must_use]
    pub fn is_evictable(&self, now: Instant, idle_timeout: Duration) -> bool {
        let state = self.state.lock();
        state.status.is_terminal()
            && state.registry.is_empty()
            && now.saturating_duration_since(state.last_activity) > idle_timeout
    }

    /// Read-only view for status queries
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            status: state.status,
            last_sequence: state.log.last_sequence(),
            chunk_count: state.log.len(),
            observer_count: state.registry.count(),
            created_at: self.created_at,
            last_activity_at: state.last_activity_at,
        }
    }
}

impl ChunkBroadcaster for ConversationSession {
    fn broadcast(&self, chunk: Chunk) -> BroadcastOutcome {
        let mut state = self.state.lock();
        if state.torn_down || state.status.is_terminal() {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                sequence = chunk.sequence,
                "Ignoring broadcast on finished session"
            );
            return BroadcastOutcome::Ignored;
        }

        let report = match state.record(&chunk) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Dropping chunk"
                );
                return BroadcastOutcome::Rejected(e);
            }
        };

        match chunk.status {
            ChunkStatus::Streaming => {
                if state.status == SessionStatus::Pending {
                    state.status = SessionStatus::Streaming;
                }
            }
            ChunkStatus::Completed => {
                state.status = SessionStatus::Completed;
                state.release_producer(false);
                tracing::info!(
                    conversation_id = %self.conversation_id,
                    sequence = chunk.sequence,
                    observers = state.registry.count(),
                    "Conversation completed"
                );
            }
            ChunkStatus::Error => {
                state.status = SessionStatus::Interrupted;
                state.release_producer(false);
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    sequence = chunk.sequence,
                    "Producer reported an error chunk"
                );
            }
        }

        if !report.all_succeeded() {
            Self::release_if_idle(&self.conversation_id, &mut state);
        }
        BroadcastOutcome::Delivered(report)
    }
}

impl fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConversationSession")
            .field("conversation_id", &self.conversation_id)
            .field("status", &state.status)
            .field("chunks", &state.log.len())
            .field("observers", &state.registry.count())
            .field("torn_down", &state.torn_down)
            .finish()
    }
}
