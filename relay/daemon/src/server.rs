//! HTTP/SSE Surface
//!
//! Serves resumable conversation streams over Server-Sent Events:
//!
//! ```text
//!   GET  /api/chat/stream?conversationId=..&message=..&lastSeq=..   SSE chunks
//!   GET  /api/chat/status/{conversationId}                         StatusReport
//!   POST /api/chat/end/{conversationId}                            acknowledgment
//!   GET  /health                                                   HealthReport
//! ```
//!
//! Each SSE connection is one observer. The connection's stream owns an
//! [`ObserverGuard`], so however the connection goes away (client closes,
//! terminal chunk sent, server shuts down) the observer is detached exactly
//! once.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use relay_core::{
    Chunk, ConversationId, ConversationSession, HealthReport, ObserverId, RelayError,
    SessionRegistry, StatusReport,
};

/// Interval between SSE keep-alive comments
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared application state passed to axum handlers
#[derive(Clone)]
pub struct AppState {
    /// Directory of live sessions
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    /// Wrap a registry
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

/// Build the axum router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/stream", get(stream_handler))
        .route("/api/chat/status/{conversation_id}", get(status_handler))
        .route("/api/chat/end/{conversation_id}", post(end_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the router on `listener` until `shutdown` resolves
pub async fn serve<F>(
    registry: Arc<SessionRegistry>,
    listener: TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(addr = %local_addr, "Relay daemon listening");

    axum::serve(listener, build_router(AppState::new(registry)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

// =============================================================================
// Request / Response Bodies
// =============================================================================

/// Query string of the stream endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    /// Conversation to observe (required)
    pub conversation_id: Option<String>,
    /// Initial input, only used when the conversation is new
    pub message: Option<String>,
    /// Last sequence the client already holds
    pub last_seq: Option<String>,
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable reason
    pub error: String,
}

/// Acknowledgment of a manual end
#[derive(Debug, Serialize, Deserialize)]
pub struct EndResponse {
    /// Always `true`; ending an unknown conversation is not an error
    pub success: bool,
    /// Human-readable acknowledgment
    pub message: String,
    /// Whether a live session was ended
    pub existed: bool,
}

/// Interpret `lastSeq`
///
/// Absent, blank, negative or unparseable values mean the client holds
/// nothing yet.
fn parse_cursor(raw: Option<&str>) -> Option<u64> {
    let raw = raw?.trim();
    match raw.parse::<u64>() {
        Ok(seq) => Some(seq),
        Err(_) => {
            if !raw.is_empty() {
                debug!(
                    last_seq = raw,
                    "Ignoring non-numeric lastSeq, replaying from start"
                );
            }
            None
        }
    }
}

fn error_response(status: StatusCode, error: &RelayError) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// =============================================================================
// Observer Streams
// =============================================================================

/// Detaches its observer when dropped
struct ObserverGuard {
    session: Arc<ConversationSession>,
    observer_id: ObserverId,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if self.session.detach_observer(&self.observer_id) {
            debug!(
                conversation_id = %self.session.conversation_id(),
                observer_id = %self.observer_id,
                "Connection closed, observer detached"
            );
        }
    }
}

fn chunk_event(chunk: &Chunk) -> Event {
    let event = Event::default().id(chunk.sequence.to_string());
    match serde_json::to_string(chunk) {
        Ok(data) => event.data(data),
        Err(e) => {
            warn!(sequence = chunk.sequence, error = %e, "Failed to encode chunk");
            event.comment("chunk could not be encoded")
        }
    }
}

/// SSE events for one observer; ends after the first terminal chunk
fn observer_events(
    rx: mpsc::Receiver<Chunk>,
    guard: ObserverGuard,
    finished: bool,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let chunks = ReceiverStream::new(rx);
    stream::unfold(
        (chunks, guard, finished),
        |(mut chunks, guard, finished)| async move {
            if finished {
                return None;
            }
            let chunk = chunks.next().await?;
            let terminal = chunk.is_terminal();
            Some((Ok(chunk_event(&chunk)), (chunks, guard, terminal)))
        },
    )
}

/// Attach a new observer to `conversation_id`, creating the session if needed
///
/// Retries once if the session was torn down between lookup and attach.
fn open_observer(
    registry: &SessionRegistry,
    conversation_id: &ConversationId,
    message: &str,
    observer_id: ObserverId,
    cursor: Option<u64>,
) -> Result<(mpsc::Receiver<Chunk>, ObserverGuard, bool), RelayError> {
    let mut last_error = RelayError::SessionEnded(conversation_id.clone());

    for _ in 0..2 {
        let session = registry.get_or_create(conversation_id, message);

        // Room for the full replay plus the configured live backlog
        let backlog = session.snapshot().chunk_count;
        let capacity = registry.config().observer_channel_capacity + backlog;
        let (tx, rx) = mpsc::channel(capacity);

        match session.attach_observer(observer_id, Box::new(tx), cursor) {
            Ok(report) => {
                // Delivery and status change share the session lock, so read status first
                let finished = session.status().is_terminal() && rx.is_empty();
                debug!(
                    replayed = report.replayed,
                    synthetic_completion = report.synthetic_completion,
                    finished = finished,
                    "Observer attached"
                );
                let guard = ObserverGuard {
                    session,
                    observer_id,
                };
                return Ok((rx, guard, finished));
            }
            Err(e) => {
                debug!(error = %e, "Session ended during attach, retrying");
                last_error = e;
            }
        }
    }

    Err(last_error)
}

// =============================================================================
// Handlers
// =============================================================================

/// `GET /api/chat/stream`
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let raw_id = params.conversation_id.as_deref().unwrap_or("");
    let conversation_id = match ConversationId::parse(raw_id) {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejected stream request without conversationId");
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };
    let cursor = parse_cursor(params.last_seq.as_deref());
    let message = params.message.unwrap_or_default();
    let observer_id = ObserverId::new();

    let span = tracing::info_span!(
        "observer",
        conversation_id = %conversation_id,
        observer_id = %observer_id,
    );
    let opened = span.in_scope(|| {
        info!(cursor = ?cursor, "New stream connection");
        open_observer(
            &state.registry,
            &conversation_id,
            &message,
            observer_id,
            cursor,
        )
    });

    match opened {
        Ok((rx, guard, finished)) => Sse::new(observer_events(rx, guard, finished))
            .keep_alive(
                KeepAlive::new()
                    .interval(KEEP_ALIVE_INTERVAL)
                    .text("keep-alive"),
            )
            .into_response(),
        Err(e) => error_response(StatusCode::GONE, &e),
    }
}

/// `GET /api/chat/status/{conversation_id}`
pub async fn status_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<StatusReport> {
    let report = match ConversationId::parse(&conversation_id) {
        Ok(id) => state.registry.status(&id),
        Err(_) => StatusReport::missing(),
    };
    Json(report)
}

/// `POST /api/chat/end/{conversation_id}`
pub async fn end_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<EndResponse> {
    let existed = match ConversationId::parse(&conversation_id) {
        Ok(id) => state.registry.end(&id),
        Err(_) => false,
    };
    info!(conversation_id = %conversation_id, existed = existed, "Manual end requested");
    Json(EndResponse {
        success: true,
        message: "session ended".to_string(),
        existed,
    })
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.registry.health())
}

// =============================================================================
// Tests
// =============================================================================
