// ---------------------------------------------------------------------------
// streaming.rs: long-lived push sessions: snapshot, heartbeats, teardown
// ---------------------------------------------------------------------------
//
// Each session is one spawned task that owns its heartbeat interval and the
// sending half of the frame channel. The registry only holds a cancellation
// token per session so shutdown can enumerate and close them. The task, and
// only the task, removes its own registry entry on exit.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::Json;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::models::StreamFrame;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Lifecycle of one session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Open,
    Streaming,
    Closed,
}

struct StreamSession {
    id: Uuid,
    opened_at: DateTime<Utc>,
    state: SessionState,
    frames_sent: u64,
}

impl StreamSession {
    fn new(id: Uuid, opened_at: DateTime<Utc>) -> Self {
        Self { id, opened_at, state: SessionState::Open, frames_sent: 0 }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session {} cannot go {:?} -> {:?}", self.id, self.state, next);
        tracing::debug!(session = %self.id, "stream: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Push a frame. `false` once the peer is gone.
    fn push(&mut self, tx: &UnboundedSender<StreamFrame>, frame: StreamFrame) -> bool {
        let ok = tx.send(frame).is_ok();
        if ok {
            self.frames_sent += 1;
        }
        ok
    }
}

struct SessionEntry {
    cancel: CancellationToken,
    opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Registry of open stream sessions keyed by connection id.
#[derive(Clone)]
pub struct StreamSessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Duration,
}

impl StreamSessionManager {
    pub fn new(dispatcher: Arc<Dispatcher>, heartbeat: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            dispatcher,
            heartbeat,
        }
    }

    /// Accept a connection: register it and start its session task.
    /// Frames arrive on the returned receiver; dropping it closes the session.
    ///
    /// The channel is unbounded: a peer that stops reading makes the buffer
    /// grow rather than stalling heartbeats.
    pub async fn open(&self) -> (Uuid, mpsc::UnboundedReceiver<StreamFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let opened_at = Utc::now();

        self.sessions
            .write()
            .await
            .insert(id, SessionEntry { cancel: cancel.clone(), opened_at });

        tracing::info!(session = %id, "stream session opened");

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_session(StreamSession::new(id, opened_at), tx, cancel)
                .await;
        });

        (id, rx)
    }

    /// Server-side close of one session. `false` if it is already gone.
    pub async fn close(&self, id: Uuid) -> bool {
        match self.sessions.read().await.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every open session (graceful shutdown). Returns how many were signalled.
    pub async fn close_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            entry.cancel.cancel();
        }
        if !sessions.is_empty() {
            tracing::info!("Closing {} open stream session(s)", sessions.len());
        }
        sessions.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo { id: *id, opened_at: entry.opened_at })
            .collect();
        list.sort_by_key(|s| s.opened_at);
        list
    }

    async fn run_session(
        &self,
        mut session: StreamSession,
        tx: UnboundedSender<StreamFrame>,
        cancel: CancellationToken,
    ) {
        session.advance(SessionState::Streaming);

        // OPEN -> STREAMING: exactly one snapshot (or error) frame.
        let first = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tx.closed() => None,
            res = self.dispatcher.snapshot() => Some(match res {
                Ok(events) => {
                    tracing::debug!(session = %session.id, events = events.len(), "stream: snapshot ready");
                    StreamFrame::Snapshot { events }
                }
                Err(e) => {
                    tracing::warn!(session = %session.id, "stream: snapshot failed: {}", e);
                    StreamFrame::Error { error: e.to_string() }
                }
            }),
        };

        if let Some(frame) = first {
            if session.push(&tx, frame) {
                let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tx.closed() => break,
                        _ = heartbeat.tick() => {
                            if !session.push(&tx, StreamFrame::heartbeat()) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        session.advance(SessionState::Closed);
        self.sessions.write().await.remove(&session.id);

        let lifetime = Utc::now() - session.opened_at;
        tracing::info!(
            session = %session.id,
            frames = session.frames_sent,
            lifetime_secs = lifetime.num_seconds(),
            "stream session closed"
        );
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn frame_event(frame: &StreamFrame) -> Event {
    Event::default().json_data(frame).unwrap_or_else(|e| {
        tracing::error!("stream: frame serialization failed: {}", e);
        Event::default().data(r#"{"error":"frame serialization failed"}"#)
    })
}

/// GET /sse: open a push stream of calendar state and heartbeats.
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (_id, rx) = state.sessions.open().await;
    let stream = UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame_event(&frame)));
    Sse::new(stream)
}

/// GET /api/streams: currently open sessions.
pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list_sessions().await)
}
