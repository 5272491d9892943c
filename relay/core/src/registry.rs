//! Session Registry
//!
//! Process-wide directory of live conversation sessions. The registry is an
//! explicit object: create it at startup, share it behind an `Arc`, and hand
//! it to whatever transport serves observers.
//!
//! # Lifecycle
//!
//! ```text
//!   get_or_create ──▶ session (producer started once)
//!         │
//!         ├── end() ─────────────▶ removed + torn down
//!         │
//!         └── sweep (periodic) ──▶ removed + torn down when terminal,
//!                                  observer-less and idle
//! ```
//!
//! A session is removed from the map before it is torn down, so lookups
//! never hand out an ended session once removal has happened.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::chunk::ConversationId;
use crate::config::RelayConfig;
use crate::producer::{ContentProducer, SimulatedProducer};
use crate::session::{ConversationSession, SessionStatus};

/// Answer to a status query
///
/// Unknown conversations report `exists: false` and omit every other field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Whether a live session exists
    pub exists: bool,
    /// Lifecycle status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    /// High-water mark of the event log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
    /// Observers currently attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_count: Option<usize>,
    /// When the session was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last attach, detach or broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    /// Report for a conversation the registry does not know
    #[must_use]
    pub fn missing() -> Self {
        Self {
            exists: false,
            status: None,
            last_sequence: None,
            observer_count: None,
            created_at: None,
            last_activity_at: None,
        }
    }

    fn of(session: &ConversationSession) -> Self {
        let snapshot = session.snapshot();
        Self {
            exists: true,
            status: Some(snapshot.status),
            last_sequence: snapshot.last_sequence,
            observer_count: Some(snapshot.observer_count),
            created_at: Some(snapshot.created_at),
            last_activity_at: Some(snapshot.last_activity_at),
        }
    }
}

/// Liveness summary of the registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Always `"ok"` while the process serves requests
    pub status: String,
    /// Sessions currently held
    pub active_sessions: usize,
    /// When the report was taken
    pub timestamp: DateTime<Utc>,
}

/// Directory of live conversation sessions
pub struct SessionRegistry {
    sessions: DashMap<ConversationId, Arc<ConversationSession>>,
    producer: Arc<dyn ContentProducer>,
    config: RelayConfig,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry that starts `producer` for new sessions
    pub fn new(producer: Arc<dyn ContentProducer>, config: RelayConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            producer,
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Registry backed by the simulated producer at the configured pacing
    #[must_use]
    pub fn simulated(config: RelayConfig) -> Self {
        let producer = Arc::new(SimulatedProducer::new(config.pacing));
        Self::new(producer, config)
    }

    /// Configuration the registry was built with
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Return the session for `conversation_id`, creating it if needed
    ///
    /// A new session gets `initial_input` and has its producer started; for
    /// an existing session the input is ignored. Must be called from within
    /// a tokio runtime.
    pub fn get_or_create(
        &self,
        conversation_id: &ConversationId,
        initial_input: &str,
    ) -> Arc<ConversationSession> {
        let (session, created) = match self.sessions.entry(conversation_id.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let session = Arc::new(ConversationSession::new(
                    conversation_id.clone(),
                    initial_input,
                ));
                entry.insert(Arc::clone(&session));
                (session, true)
            }
        };

        // Started outside the map guard; the producer only ever touches the session.
        if created {
            tracing::info!(
                conversation_id = %conversation_id,
                active_sessions = self.sessions.len(),
                "Created session"
            );
            session.start(Arc::clone(&self.producer));
        }
        session
    }

    /// Look up a session without creating it
    #[must_use]
    pub fn get(&self, conversation_id: &ConversationId) -> Option<Arc<ConversationSession>> {
        self.sessions
            .get(conversation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Status of a conversation
    #[must_use]
    pub fn status(&self, conversation_id: &ConversationId) -> StatusReport {
        self.get(conversation_id)
            .map_or_else(StatusReport::missing, |session| StatusReport::of(&session))
    }

    /// Remove and end a session; returns whether it existed
    pub fn end(&self, conversation_id: &ConversationId) -> bool {
        match self.sessions.remove(conversation_id) {
            Some((_, session)) => {
                session.end_manually();
                true
            }
            None => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    "End requested for unknown session"
                );
                false
            }
        }
    }

    /// Evict idle sessions as of now; returns how many were evicted
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Evict every session that is terminal, observer-less and idle at `now`
    pub fn sweep_at(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout;

        // Observers whose connection vanished without a detach must not pin
        // a session.
        let mut candidates = Vec::new();
        for entry in &self.sessions {
            entry.value().prune_closed_observers();
            if entry.value().is_evictable(now, idle_timeout) {
                candidates.push(entry.key().clone());
            }
        }

        let mut evicted = 0;
        for conversation_id in candidates {
            // Re-checked under the entry lock: an observer may have attached since.
            let removed = self.sessions.remove_if(&conversation_id, |_, session| {
                session.is_evictable(now, idle_timeout)
            });
            if let Some((_, session)) = removed {
                session.teardown("idle");
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::info!(
                evicted = evicted,
                active_sessions = self.sessions.len(),
                "Swept idle sessions"
            );
        }
        evicted
    }

    /// Spawn the periodic sweep task
    ///
    /// The task holds only a weak reference and exits once the registry is
    /// dropped. Calling this again replaces the previous task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    ticker.tick().await;
                    let Some(registry) = registry.upgrade() else {
                        tracing::debug!("Registry dropped, sweeper exiting");
                        break;
                    };
                    registry.sweep();
                }
            }
            .instrument(tracing::info_span!("sweeper")),
        );

        tracing::info!(interval_secs = period.as_secs(), "Started session sweeper");
        if let Some(previous) = self.sweeper.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Stop the sweeper and end every session; returns how many were ended
    pub fn shutdown(&self) -> usize {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let ids = self.conversation_ids();
        let mut ended = 0;
        for conversation_id in ids {
            if let Some((_, session)) = self.sessions.remove(&conversation_id) {
                session.teardown("shutdown");
                ended += 1;
            }
        }

        tracing::info!(ended = ended, "Session registry shut down");
        ended
    }

    /// Liveness summary
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            active_sessions: self.sessions.len(),
            timestamp: Utc::now(),
        }
    }

    /// Number of sessions held
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of every session held, in no particular order
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("producer", &self.producer.name())
            .field("config", &self.config)
            .finish()
    }
}
