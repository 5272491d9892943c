//! Relay Core - Resumable Streaming Sessions
//!
//! This crate keeps a streamed response alive independently of the
//! connections watching it. A producer writes sequenced chunks into a
//! per-conversation session; any number of observers attach, drop off and
//! re-attach with a cursor, and each resumes exactly where it left off.
//!
//! # Architecture
//!
//! ```text
//!                        SessionRegistry
//!              (conversation id ─▶ ConversationSession)
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          │                    │                    │
//!   ContentProducer ──▶ ConversationSession ◀── sweeper (idle eviction)
//!   (via ChunkBroadcaster)      │
//!                     ┌─────────┴─────────┐
//!                     │                   │
//!                 EventLog          ClientRegistry
//!              (append-only)     (observers + cursors)
//!                                         │
//!                          ┌──────────────┼──────────────┐
//!                       obs-1           obs-2          obs-3
//!                     (ChunkSink)     (ChunkSink)    (ChunkSink)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{ConversationId, ObserverId, RelayConfig, SessionRegistry};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(SessionRegistry::simulated(RelayConfig::default()));
//!     registry.start_sweeper();
//!
//!     let id = ConversationId::parse("c1").unwrap();
//!     let session = registry.get_or_create(&id, "hello");
//!
//!     let (tx, mut rx) = mpsc::channel(256);
//!     session.attach_observer(ObserverId::new(), Box::new(tx), None).unwrap();
//!
//!     while let Some(chunk) = rx.recv().await {
//!         println!("{} {}", chunk.sequence, chunk.content);
//!         if chunk.is_terminal() {
//!             break;
//!         }
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`chunk`]: Wire payload and conversation ids
//! - [`event_log`]: Append-only per-conversation chunk history
//! - [`client_registry`]: Attached observers, cursors and fan-out
//! - [`session`]: One conversation's lifecycle, replay and broadcast
//! - [`producer`]: Content producer seam and the simulated producer
//! - [`registry`]: Process-wide session directory and idle sweep
//! - [`config`]: Layered configuration (CLI, env, TOML, defaults)
//! - [`error`]: Error types
//!
//! # No Transport Dependencies
//!
//! Nothing here knows about HTTP or SSE. Observers are anything that
//! implements [`ChunkSink`].

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chunk;
pub mod client_registry;
pub mod config;
pub mod error;
pub mod event_log;
pub mod producer;
pub mod registry;
pub mod session;

// Re-exports for convenience
pub use chunk::{Chunk, ChunkStatus, ConversationId};
pub use client_registry::{
    ChunkSink, ClientRegistry, DeliveryReport, ObserverHandle, ObserverId, ReplayReport,
};
pub use error::{ProducerError, RelayError, SinkError};
pub use event_log::EventLog;
pub use producer::{ContentProducer, SimulatedProducer, DEFAULT_PACING};
pub use registry::{HealthReport, SessionRegistry, StatusReport};
pub use session::{
    BroadcastOutcome, ChunkBroadcaster, ConversationSession, SessionSnapshot, SessionStatus,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, RelayToml,
};
