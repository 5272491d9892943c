//! Integration tests for resumable conversation sessions
//!
//! These tests drive sessions and the registry the way a transport would:
//! observers attach with a cursor, drop off, come back, and must see every
//! chunk past their cursor exactly once.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::Instant;

use relay_core::{
    BroadcastOutcome, Chunk, ChunkBroadcaster, ChunkSink, ChunkStatus, ConversationId,
    ConversationSession, ObserverId, RelayConfig, SessionRegistry, SessionStatus,
};

// =============================================================================
// Helpers
// =============================================================================

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn conv(id: &str) -> ConversationId {
    ConversationId::parse(id).unwrap()
}

/// Streaming chunk whose content names its sequence
fn word(id: &ConversationId, seq: u64) -> Chunk {
    Chunk::streaming(id.clone(), seq, format!("w{seq}"))
}

fn attach(session: &ConversationSession, sink: Box<dyn ChunkSink>, cursor: Option<u64>) {
    session
        .attach_observer(ObserverId::new(), sink, cursor)
        .unwrap();
}

fn bounded(capacity: usize) -> (Box<dyn ChunkSink>, mpsc::Receiver<Chunk>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Box::new(tx), rx)
}

fn unbounded() -> (Box<dyn ChunkSink>, mpsc::UnboundedReceiver<Chunk>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(tx), rx)
}

fn drain(rx: &mut mpsc::Receiver<Chunk>) -> Vec<u64> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|c| c.sequence)
        .collect()
}

fn drain_unbounded(rx: &mut mpsc::UnboundedReceiver<Chunk>) -> Vec<u64> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|c| c.sequence)
        .collect()
}

/// Receive until a terminal chunk arrives or the sink is dropped
async fn collect_until_terminal(rx: &mut mpsc::Receiver<Chunk>) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
        let done = chunk.is_terminal();
        chunks.push(chunk);
        if done {
            break;
        }
    }
    chunks
}

// =============================================================================
// Replay
// =============================================================================

#[test]
fn test_reattach_with_last_cursor_never_duplicates() {
    let id = conv("c1");
    let session = ConversationSession::new(id.clone(), "hello");
    let mut seen = Vec::new();

    // First connection sees 0..=2 and drops
    let (sink, mut rx) = bounded(64);
    let first = ObserverId::new();
    session.attach_observer(first, sink, None).unwrap();
    for seq in 0..3 {
        session.broadcast(word(&id, seq));
    }
    seen.extend(drain(&mut rx));
    session.detach_observer(&first);

    // Produced while nobody watched
    for seq in 3..6 {
        session.broadcast(word(&id, seq));
    }

    // Reconnect twice with the same cursor: identical replays
    let cursor = seen.last().copied();
    for _ in 0..2 {
        let (sink, mut rx) = bounded(64);
        let observer = ObserverId::new();
        session.attach_observer(observer, sink, cursor).unwrap();
        assert_eq!(drain(&mut rx), vec![3, 4, 5]);
        session.detach_observer(&observer);
    }

    // Final connection resumes from where the last replay ended
    let (sink, mut rx) = bounded(64);
    attach(&session, sink, Some(5));
    session.broadcast(Chunk::streaming(id.clone(), 6, "w6"));
    session.broadcast(Chunk::completed(id, 7));
    seen.extend([3, 4, 5]);
    seen.extend(drain(&mut rx));

    assert_eq!(seen, (0..=7).collect::<Vec<_>>());
}

#[test]
fn test_scenario_attach_at_cursor_two() {
    let id = conv("c1");
    let session = ConversationSession::new(id.clone(), "hello");
    for seq in 0..4 {
        session.broadcast(word(&id, seq));
    }
    session.broadcast(Chunk::completed(id, 4));

    let (sink, mut rx) = bounded(64);
    attach(&session, sink, Some(2));

    assert_eq!(drain(&mut rx), vec![3, 4]);
}

#[test]
fn test_terminal_replay_yields_single_completion() {
    let id = conv("c1");
    let session = ConversationSession::new(id.clone(), "hello");
    for seq in 0..4 {
        session.broadcast(word(&id, seq));
    }
    session.broadcast(Chunk::completed(id, 4));

    let (sink, mut rx) = bounded(64);
    let report = session
        .attach_observer(ObserverId::new(), sink, Some(4))
        .unwrap();

    assert!(report.synthetic_completion);
    let marker = rx.try_recv().unwrap();
    assert_eq!(marker.sequence, 5);
    assert_eq!(marker.status, ChunkStatus::Completed);
    assert_eq!(marker.content, "");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_replay_tolerates_sequence_gaps() {
    let id = conv("gappy");
    let session = ConversationSession::new(id.clone(), "hello");
    for seq in [0, 1, 5, 9] {
        session.broadcast(word(&id, seq));
    }

    let (sink, mut rx) = bounded(64);
    attach(&session, sink, Some(3));
    assert_eq!(drain(&mut rx), vec![5, 9]);

    // A failure stamps last + 1, not len
    session.fail("backend went away");
    let error = rx.try_recv().unwrap();
    assert_eq!(error.sequence, 10);
    assert_eq!(error.status, ChunkStatus::Error);
}

#[test]
fn test_regression_is_rejected_and_log_unchanged() {
    let id = conv("c1");
    let session = ConversationSession::new(id.clone(), "hello");
    session.broadcast(Chunk::streaming(id.clone(), 2, "a"));

    let outcome = session.broadcast(Chunk::streaming(id.clone(), 1, "b"));

    assert!(matches!(outcome, BroadcastOutcome::Rejected(_)));
    assert_eq!(session.last_sequence(), Some(2));
    assert_eq!(session.snapshot().chunk_count, 1);
}

// =============================================================================
// Fan-out
// =============================================================================

#[test]
fn test_broken_observer_does_not_affect_others() {
    let id = conv("c1");
    let session = ConversationSession::new(id.clone(), "hello");

    let (sink_a, mut rx_a) = bounded(64);
    let (sink_b, mut rx_b) = bounded(64);
    let (slow, _rx_slow) = bounded(1);
    let (gone, rx_gone) = bounded(64);
    attach(&session, sink_a, None);
    attach(&session, sink_b, None);
    attach(&session, slow, None);
    attach(&session, gone, None);
    drop(rx_gone);

    for seq in 0..5 {
        assert!(session.broadcast(word(&id, seq)).is_delivered());
    }

    assert_eq!(drain(&mut rx_a), vec![0, 1, 2, 3, 4]);
    assert_eq!(drain(&mut rx_b), vec![0, 1, 2, 3, 4]);
    assert_eq!(session.observer_count(), 2);
}

#[test]
fn test_attach_during_concurrent_broadcast() {
    const CHUNKS: u64 = 500;
    let id = conv("busy");
    let session = ConversationSession::new(id.clone(), "hello");

    let receivers = std::thread::scope(|scope| {
        scope.spawn(|| {
            for seq in 0..CHUNKS {
                session.broadcast(word(&id, seq));
            }
        });

        let mut receivers = Vec::new();
        for _ in 0..20 {
            let (sink, rx) = unbounded();
            attach(&session, sink, None);
            receivers.push(rx);
            std::thread::yield_now();
        }
        receivers
    });

    for mut rx in receivers {
        assert_eq!(drain_unbounded(&mut rx), (0..CHUNKS).collect::<Vec<_>>());
    }
}

// =============================================================================
// Lifecycle through the registry
// =============================================================================

fn registry(pacing: Duration) -> Arc<SessionRegistry> {
    let config = RelayConfig::new()
        .with_pacing(pacing)
        .with_idle_timeout(Duration::from_secs(60));
    Arc::new(SessionRegistry::simulated(config))
}

#[tokio::test]
async fn test_simulated_reply_streams_cumulative_text() {
    let registry = registry(Duration::from_millis(1));
    let session = registry.get_or_create(&conv("c1"), "hello");

    let (sink, mut rx) = bounded(256);
    attach(&session, sink, None);
    let chunks = collect_until_terminal(&mut rx).await;

    let (last, streamed) = chunks.split_last().unwrap();
    assert_eq!(last.status, ChunkStatus::Completed);
    assert_eq!(last.sequence, streamed.len() as u64);
    assert_eq!(streamed[0].content, "This");
    assert!(streamed
        .windows(2)
        .all(|w| w[1].content.starts_with(&w[0].content)));
    assert!(streamed
        .last()
        .unwrap()
        .content
        .starts_with("This is a reply to \"hello\"."));
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[tokio::test]
async fn test_manual_end_while_streaming_stops_delivery() {
    let registry = registry(Duration::from_millis(20));
    let id = conv("c1");
    let session = registry.get_or_create(&id, "hello");

    let (sink, mut rx) = bounded(256);
    attach(&session, sink, None);
    let first = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.sequence, 0);

    assert!(registry.end(&id));

    // Whatever was queued before the end drains, then the sink is closed
    let mut rest = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await {
        rest.push(chunk);
    }
    assert!(rest.iter().all(|c| c.status == ChunkStatus::Streaming));
    assert!(!registry.status(&id).exists);
    assert_eq!(session.status(), SessionStatus::Completed);

    // The producer was aborted: nothing more lands in the log
    let high_water = session.last_sequence();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.last_sequence(), high_water);
}

#[tokio::test]
async fn test_idle_eviction_rules() {
    let registry = registry(Duration::ZERO);
    let idle = registry.get_or_create(&conv("idle"), "hello");
    let watched = registry.get_or_create(&conv("watched"), "hello");

    let (sink, mut rx) = bounded(256);
    attach(&watched, sink, None);
    collect_until_terminal(&mut rx).await;
    while idle.status() != SessionStatus::Completed {
        tokio::task::yield_now().await;
    }

    let streaming = ConversationSession::new(conv("streaming"), "hello");
    streaming.broadcast(word(&conv("streaming"), 0));
    let far_future = Instant::now() + Duration::from_secs(3600);
    assert!(!streaming.is_evictable(far_future, Duration::from_secs(60)));

    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(registry.sweep_at(later), 1);
    assert!(registry.get(&conv("idle")).is_none());
    assert!(registry.get(&conv("watched")).is_some());

    // Once the last observer leaves, the watched session becomes evictable too
    drop(rx);
    let much_later = Instant::now() + Duration::from_secs(122);
    assert_eq!(registry.sweep_at(much_later), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_late_observer_after_completion_via_registry() {
    let registry = registry(Duration::ZERO);
    let id = conv("c1");
    let session = registry.get_or_create(&id, "hello");
    while session.status() != SessionStatus::Completed {
        tokio::task::yield_now().await;
    }

    // A second request for the same conversation does not restart anything
    let again = registry.get_or_create(&id, "different input");
    assert!(Arc::ptr_eq(&session, &again));

    let (sink, mut rx) = bounded(256);
    attach(&again, sink, None);
    let chunks = collect_until_terminal(&mut rx).await;
    assert_eq!(chunks.len() as u64, session.last_sequence().unwrap() + 1);
    assert!(chunks.last().unwrap().is_terminal());
}
