use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use strand_core::content::{Content, Part};
use strand_core::error::{SessionError, StrandError};

use crate::llm::ModelBackend;

pub type SessionId = String;

/// Minimum history length worth summarizing.
const MIN_TURNS_TO_COMPRESS: usize = 3;
const SUMMARY_PROMPT: &str = "Summarize the following conversation:\n\n";

pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: SessionId,
    pub history: Vec<Content>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionState>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// History of `session_id`, creating an empty session when it is new.
    pub async fn load_or_create(&self, session_id: &str) -> SessionState {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                SessionState {
                    id: session_id.to_string(),
                    history: Vec::new(),
                    created_at: now,
                    updated_at: now,
                }
            })
            .clone()
    }

    pub async fn save_history(&self, session_id: &str, history: Vec<Content>) {
        let mut sessions = self.sessions.write().await;
        let now = Utc::now();
        if let Some(existing) = sessions.get_mut(session_id) {
            existing.history = history;
            existing.updated_at = now;
            return;
        }

        sessions.insert(
            session_id.to_string(),
            SessionState {
                id: session_id.to_string(),
                history,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Session ids, most recently updated first.
    pub async fn list(&self) -> Vec<SessionId> {
        let sessions = self.sessions.read().await;
        let mut states: Vec<&SessionState> = sessions.values().collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        states.into_iter().map(|s| s.id.clone()).collect()
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStatus {
    Compressed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionOutcome {
    pub original_token_count: u32,
    pub new_token_count: u32,
    pub status: CompressionStatus,
}

/// Replace `history` with a single model turn summarizing it.
///
/// Histories shorter than three turns are refused and left untouched.
pub async fn compress_history(
    backend: &dyn ModelBackend,
    model: &str,
    history: &mut Vec<Content>,
) -> Result<CompressionOutcome, StrandError> {
    if history.len() < MIN_TURNS_TO_COMPRESS {
        return Err(SessionError::NothingToCompress.into());
    }
    let original_token_count = backend.count_tokens(history).await?;

    let mut prompt = String::from(SUMMARY_PROMPT);
    for part in history.iter().flat_map(|c| c.parts.iter()) {
        match part {
            Part::Text { text } if !text.is_empty() => {
                prompt.push_str(text);
                prompt.push('\n');
            }
            _ => {}
        }
    }

    let summary = backend.generate(model, &prompt).await?;
    let compressed = vec![Content::model(summary)];
    let new_token_count = backend.count_tokens(&compressed).await?;
    *history = compressed;

    tracing::info!(
        original_token_count,
        new_token_count,
        "chat history compressed"
    );
    Ok(CompressionOutcome {
        original_token_count,
        new_token_count,
        status: CompressionStatus::Compressed,
    })
}
