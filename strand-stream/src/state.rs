use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use strand_agent::chat::ChatHub;
use strand_agent::session::{CompressionOutcome, new_session_id};
use strand_core::error::{SessionError, StrandError};
use strand_core::event::{EventEnvelope, StreamEvent};
use strand_core::tool_call::ConfirmationOutcome;

use crate::broadcaster::Broadcaster;
use crate::types::HealthResponse;

/// What the stream layer drives: something that turns a prompt into events.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn start(
        &self,
        session_id: &str,
        prompt: String,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent>;

    /// Resolve a pending tool confirmation. False when nothing was waiting.
    async fn confirm(&self, call_id: &str, outcome: ConfirmationOutcome) -> bool;

    async fn compress(&self, session_id: &str) -> Result<CompressionOutcome, StrandError>;
}

#[async_trait]
impl SessionRunner for ChatHub {
    async fn start(
        &self,
        session_id: &str,
        prompt: String,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.session(session_id).await.send_message(prompt, cancel)
    }

    async fn confirm(&self, call_id: &str, outcome: ConfirmationOutcome) -> bool {
        self.broker().resolve(call_id, outcome)
    }

    async fn compress(&self, session_id: &str) -> Result<CompressionOutcome, StrandError> {
        match self.existing(session_id).await {
            Some(chat) => chat.compress().await,
            None => Err(SessionError::NotFound(session_id.to_string()).into()),
        }
    }
}

/// Shared state for the streaming HTTP layer.
#[derive(Clone)]
pub struct StreamState {
    inner: Arc<StreamStateInner>,
}

struct StreamStateInner {
    broadcaster: Broadcaster,
    runner: Arc<dyn SessionRunner>,
    started: Instant,
    /// Turns in flight per session, keyed by turn number.
    running: RwLock<HashMap<String, HashMap<u64, CancellationToken>>>,
    next_turn: AtomicU64,
    shutdown: CancellationToken,
}

impl StreamState {
    pub fn new(runner: Arc<dyn SessionRunner>) -> Self {
        Self {
            inner: Arc::new(StreamStateInner {
                broadcaster: Broadcaster::new(),
                runner,
                started: Instant::now(),
                running: RwLock::new(HashMap::new()),
                next_turn: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn runner(&self) -> &Arc<dyn SessionRunner> {
        &self.inner.runner
    }

    /// Start a turn for `session_id` (a fresh id when absent) and return the id
    /// immediately. Events are broadcast as the turn progresses.
    pub async fn submit(&self, session_id: Option<String>, prompt: String) -> String {
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_session_id);
        let cancel = self.inner.shutdown.child_token();
        let turn = self.inner.next_turn.fetch_add(1, Ordering::Relaxed);
        self.inner
            .running
            .write()
            .await
            .entry(session_id.clone())
            .or_default()
            .insert(turn, cancel.clone());

        let mut events = self.inner.runner.start(&session_id, prompt, cancel).await;
        tracing::info!(session_id = %session_id, turn, "session turn started");

        let state = self.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            let mut forwarded = 0usize;
            while let Some(event) = events.recv().await {
                state
                    .inner
                    .broadcaster
                    .broadcast(&EventEnvelope::new(id.clone(), event))
                    .await;
                forwarded += 1;
            }
            state.finish_turn(&id, turn).await;
            tracing::info!(session_id = %id, turn, events = forwarded, "session turn finished");
        });

        session_id
    }

    async fn finish_turn(&self, session_id: &str, turn: u64) {
        let mut running = self.inner.running.write().await;
        if let Some(turns) = running.get_mut(session_id) {
            turns.remove(&turn);
            if turns.is_empty() {
                running.remove(session_id);
            }
        }
    }

    /// Cancel every turn of a running session. False when it was not running.
    pub async fn cancel(&self, session_id: &str) -> bool {
        match self.inner.running.read().await.get(session_id) {
            Some(turns) => {
                turns.values().for_each(CancellationToken::cancel);
                true
            }
            None => false,
        }
    }

    /// Cancel every running session.
    pub fn cancel_all(&self) {
        self.inner.shutdown.cancel();
    }

    pub async fn running_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.running.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            subscribers: self.inner.broadcaster.len().await,
            running_sessions: self.inner.running.read().await.len(),
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }
}
